pub mod cipher;

pub use cipher::{CipherError, Direction, FileCipher, FixedKeyProvider, KeyProvider, Keystream};
