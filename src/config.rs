use {
    crate::error::{CaecodError, Result},
    serde::Deserialize,
    std::{fs::File, path::{Path, PathBuf}},
};

/// build-side configuration, shared by the manifest and tile builders
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// manifest file, or the tile store for a tile build
    pub src: PathBuf,
    /// output directory; the four part files land here
    pub db: PathBuf,
    #[serde(default)]
    pub dedup: bool,
}

impl BuildConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }
}

/// server-side configuration
///
/// `headers` become the prebuilt 200 status block; the stored payloads carry
/// the rest of the header section, so no trailing blank line is appended.
/// `h404` is a complete response and does get the blank line.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub db: PathBuf,
    /// IPv4 address (`"*"` for any) or a filesystem path when `port` is 0
    pub socket: String,
    pub port: u16,
    pub threads: usize,
    pub backlog: i32,
    pub inbuffer: usize,
    pub headers: Vec<String>,
    pub h404: Vec<String>,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let cfg: Self = load_json(path.as_ref())?;
        if cfg.threads == 0 {
            return Err(CaecodError::ConfigInvalid("threads must be at least 1".into()));
        }
        if cfg.inbuffer == 0 {
            return Err(CaecodError::ConfigInvalid("inbuffer must be non-zero".into()));
        }
        Ok(cfg)
    }

    /// status line plus configured headers, ready to precede a stored payload
    pub fn ok_header(&self) -> Vec<u8> {
        join_response("HTTP/1.1 200 OK", &self.headers, false)
    }

    /// the complete not-found response including the terminating blank line
    pub fn not_found(&self) -> Vec<u8> {
        join_response("HTTP/1.1 404 Not Found", &self.h404, true)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| CaecodError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    serde_json::from_reader(file)
        .map_err(|e| CaecodError::ConfigInvalid(format!("{}: {e}", path.display())))
}

fn join_response(status: &str, lines: &[String], terminated: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        status.len() + lines.iter().map(|l| l.len() + 2).sum::<usize>() + 4,
    );
    out.extend_from_slice(status.as_bytes());
    out.extend_from_slice(b"\r\n");
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if terminated {
        out.extend_from_slice(b"\r\n");
    }
    out
}
