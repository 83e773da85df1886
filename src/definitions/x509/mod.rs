pub mod x5chain;

pub use x5chain::{Builder, CertificateWithDer, X5Chain, X5CHAIN_COSE_HEADER_LABEL};
