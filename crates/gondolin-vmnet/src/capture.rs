#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Classic pcap (not pcapng) writer for one session's guest-side frames.
/// Best-effort: capture failures never disturb traffic.
#[derive(Debug)]
pub struct Capture {
    file: File,
    path: PathBuf,
}

const PCAP_MAGIC_USEC: u32 = 0xa1b2_c3d4;
const LINKTYPE_ETHERNET: u32 = 1;
const SNAPLEN: u32 = 65_535;

impl Capture {
    pub async fn open(dir: &Path, session_id: u64) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("gondolin-session-{session_id}.pcap"));
        let mut file = File::create(&path).await?;

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC_USEC.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes()); // major
        header.extend_from_slice(&4u16.to_le_bytes()); // minor
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        file.write_all(&header).await?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&now.subsec_micros().to_le_bytes());
        let len = frame.len().min(SNAPLEN as usize) as u32;
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(&frame[..len as usize]);
        self.file.write_all(&record).await
    }

    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}
