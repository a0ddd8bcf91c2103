pub mod activity;
pub mod agent;
pub mod config;
pub mod event;
pub mod flow;
pub mod logger;
pub mod message;
pub mod schema;
pub mod topic;
pub mod topics;
pub mod util;
