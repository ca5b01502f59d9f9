mod fingerprint;
mod node;
mod store;

pub use fingerprint::{Fingerprinter, file_fingerprint};
pub use node::RemoteNode;
pub use store::{ByteStream, CloudError, CloudStore, ErrorClass, UploadProgress, UploadSource};
