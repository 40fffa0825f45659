pub mod state_machine;
pub mod tracker;
pub mod util_stats;
