pub mod session;
pub mod state;
pub mod topic_flow;
