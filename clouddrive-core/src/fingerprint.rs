use std::{io, path::Path};

use md5::Context;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

pub struct Fingerprinter {
    ctx: Context,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.ctx.consume(chunk);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn file_fingerprint(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut fingerprint = Fingerprinter::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        fingerprint.update(&buf[..read]);
    }
    Ok(fingerprint.finish())
}
