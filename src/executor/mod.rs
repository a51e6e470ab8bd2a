mod command;
mod node_status;
mod request_executor;

pub use command::{
    Command, CommandState, GetStatisticsCommand, GetTopologyCommand, HiLoReturnCommand,
    NextHiLoCommand,
};
pub use request_executor::{RequestExecutor, CLIENT_VERSION};
