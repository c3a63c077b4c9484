mod shardcast;

pub use shardcast::*;
