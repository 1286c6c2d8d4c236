pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{files_in, game_bin, seeded_bytes, write_zip, zip_bytes};
#[allow(unused_imports)]
pub use mocks::FaultyStore;
