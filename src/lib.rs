//! Reader side of ISO/IEC 18013-5 mdoc presentations.
//!
//! [presentation::reader::ReaderModel] drives a single engagement with a holder: it derives the
//! session transcript, encrypts the device request and collects the device response.
//! [backend::ReaderBackendClient] keeps a pool of reader authentication keys certified by the
//! reader backend, which [presentation::reader::query] uses to sign requests.
pub mod backend;
pub mod cbor;
pub mod config;
pub mod definitions;
pub mod presentation;
