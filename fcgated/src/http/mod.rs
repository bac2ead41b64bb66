pub mod local_response;
pub mod server;
