pub mod cose_key;
pub use cose_key::CoseKey;
