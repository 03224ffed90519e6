pub mod handler;

pub use handler::FlowRequestHandler;
