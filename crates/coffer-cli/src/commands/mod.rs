pub mod db;
pub mod doctor;
pub mod export;
pub mod jobs;
pub mod ledger;
pub mod migrate;
pub mod restore;
