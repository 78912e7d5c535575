//! Market price provider implementations

pub mod cryptocompare;

pub use cryptocompare::CryptoCompareProvider;
