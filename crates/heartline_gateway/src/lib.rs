pub mod error;
pub mod server;
pub mod types;

pub use error::AppError;
pub use server::{router, GatewayServer};
pub use types::{ChatResponse, ChoiceView};
