pub mod checksum;
pub mod derivation;
pub mod ingest;
pub mod media;
pub mod metadata;
pub mod policy;
pub mod processor;
pub mod registry;
pub mod responsive;
pub mod sniffer;
pub mod source;
