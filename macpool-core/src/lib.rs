pub mod helpers;
pub mod kubernetes;
pub mod mac;
pub mod resources;

pub const LEADER_ELECTION_ID: &str = "kubemacpool-election";
pub const FIELD_MANAGER: &str = "kubemacpool";
