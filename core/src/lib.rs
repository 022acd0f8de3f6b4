pub mod classifier;
pub mod db;
pub mod error;
pub mod models;
pub mod normalize;
pub mod openfoodfacts;
pub mod service;
pub mod sync;
