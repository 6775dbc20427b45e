pub mod amount;
pub mod clock;
pub mod config;
pub mod csv;
pub mod deals;
pub mod error;
pub mod journal;
pub mod matching;
pub mod model;
pub mod notify;
pub mod offers;
pub mod payments;
pub mod store;
pub mod wallet;

pub use amount::Amount;
pub use config::AppConfig;
pub use deals::DealService;
pub use matching::OfferMatcher;
pub use offers::OfferService;
pub use payments::PaymentOrchestrator;
pub use wallet::{WalletCommand, WalletEngine};
