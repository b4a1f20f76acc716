pub mod deribit;
pub mod factory;
pub mod paper;
mod traits;

pub use deribit::DeribitClient;
pub use factory::build_gateway;
pub use paper::{FillBehavior, PaperExchange};
#[cfg(test)]
pub use traits::MockExchangeGateway;
pub use traits::ExchangeGateway;
