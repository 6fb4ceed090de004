pub mod fetch;
pub mod freshness;
pub mod hash;
