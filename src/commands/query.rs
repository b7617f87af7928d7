//! One-shot host operations against a device.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tether_pipe::{connect, ClientConfig, FileInfo, FileStat, FsStat, RemoteFs};
use tracing::debug;

use crate::cli::PathArgs;

/// Bytes requested per read while streaming a file.
const CAT_CHUNK: usize = 128 * 1024;

#[derive(Debug, Serialize)]
struct StatInfo {
    path: String,
    kind: &'static str,
    mode: String,
    ino: u64,
    nlink: u64,
    uid: u32,
    gid: u32,
    size: i64,
    blocks: i64,
    atime: i64,
    mtime: i64,
    ctime: i64,
}

#[derive(Debug, Serialize)]
struct DirEntry {
    name: String,
    kind: &'static str,
    ino: u64,
}

#[derive(Debug, Serialize)]
struct DfInfo {
    path: String,
    block_size: u64,
    total_bytes: u64,
    free_bytes: u64,
    avail_bytes: u64,
    files: u64,
    files_free: u64,
    name_max: u64,
}

#[derive(Debug, Serialize)]
struct CatOutput {
    path: String,
    size: usize,
    content: String,
}

fn kind(mode: u32) -> &'static str {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => "directory",
        libc::S_IFREG => "file",
        libc::S_IFLNK => "symlink",
        libc::S_IFCHR => "char-device",
        libc::S_IFBLK => "block-device",
        libc::S_IFIFO => "fifo",
        libc::S_IFSOCK => "socket",
        _ => "unknown",
    }
}

/// `ls -l` style permission string, e.g. `drwxr-xr-x`.
fn mode_string(mode: u32) -> String {
    let type_char = match mode & libc::S_IFMT {
        libc::S_IFDIR => 'd',
        libc::S_IFLNK => 'l',
        libc::S_IFCHR => 'c',
        libc::S_IFBLK => 'b',
        libc::S_IFIFO => 'p',
        libc::S_IFSOCK => 's',
        _ => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

fn stat_info(path: &Path, st: &FileStat) -> StatInfo {
    StatInfo {
        path: path.display().to_string(),
        kind: kind(st.mode),
        mode: mode_string(st.mode),
        ino: st.ino,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        size: st.size,
        blocks: st.blocks,
        atime: st.atime,
        mtime: st.mtime,
        ctime: st.ctime,
    }
}

fn df_info(path: &Path, st: &FsStat) -> DfInfo {
    let unit = if st.frsize != 0 { st.frsize } else { st.bsize };
    DfInfo {
        path: path.display().to_string(),
        block_size: st.bsize,
        total_bytes: st.blocks.saturating_mul(unit),
        free_bytes: st.bfree.saturating_mul(unit),
        avail_bytes: st.bavail.saturating_mul(unit),
        files: st.files,
        files_free: st.ffree,
        name_max: st.namemax,
    }
}

fn client_config(args: &PathArgs) -> ClientConfig {
    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    ClientConfig::new().io_timeout(timeout)
}

/// Connect, run `op` against the device, and say goodbye. The client is
/// blocking, so the whole exchange runs off the async runtime.
async fn with_remote<T, F>(args: &PathArgs, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut RemoteFs) -> Result<T> + Send + 'static,
{
    let endpoint = args.connect.clone();
    let config = client_config(args);

    tokio::task::spawn_blocking(move || {
        let conn = connect(&endpoint, &config)
            .with_context(|| format!("connecting to {}", endpoint))?;
        let mut fs = RemoteFs::new(conn);
        let result = op(&mut fs);
        if let Err(e) = fs.quit() {
            debug!(error = %e, "quit failed");
        }
        result
    })
    .await
    .context("host task failed")?
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn cmd_stat(args: PathArgs) -> Result<()> {
    let path = args.path.clone();
    let st = with_remote(&args, move |fs| {
        fs.getattr(&path)
            .with_context(|| format!("stat {}", path.display()))
    })
    .await?;

    let info = stat_info(&args.path, &st);
    if args.json {
        return print_json(&info);
    }
    println!("  Path: {}", info.path);
    println!("  Type: {}", info.kind);
    println!("  Mode: {} ({:04o})", info.mode, st.mode & 0o7777);
    println!(" Inode: {:<12} Links: {}", info.ino, info.nlink);
    println!("   Uid: {:<12} Gid: {}", info.uid, info.gid);
    println!("  Size: {:<12} Blocks: {}", info.size, info.blocks);
    println!("Access: {}", info.atime);
    println!("Modify: {}", info.mtime);
    println!("Change: {}", info.ctime);
    Ok(())
}

pub async fn cmd_ls(args: PathArgs) -> Result<()> {
    let path = args.path.clone();
    let entries = with_remote(&args, move |fs| {
        fs.list_dir(&path)
            .with_context(|| format!("listing {}", path.display()))
    })
    .await?;

    let entries: Vec<DirEntry> = entries
        .into_iter()
        .filter(|(name, _)| name != "." && name != "..")
        .map(|(name, st)| DirEntry {
            name: name.to_string_lossy().into_owned(),
            kind: kind(st.mode),
            ino: st.ino,
        })
        .collect();

    if args.json {
        return print_json(&entries);
    }
    println!("{:<12} {:<14} NAME", "INODE", "TYPE");
    for entry in entries {
        println!("{:<12} {:<14} {}", entry.ino, entry.kind, entry.name);
    }
    Ok(())
}

pub async fn cmd_cat(args: PathArgs) -> Result<()> {
    let path = args.path.clone();
    let json = args.json;
    let collected = with_remote(&args, move |fs| {
        let fi = fs
            .open(&path, &FileInfo::with_flags(libc::O_RDONLY))
            .with_context(|| format!("opening {}", path.display()))?;

        let mut stdout = std::io::stdout().lock();
        let mut content = Vec::new();
        let mut offset = 0i64;
        let result = loop {
            let chunk = match fs.read(&path, CAT_CHUNK, offset, &fi) {
                Ok(chunk) => chunk,
                Err(e) => break Err(e).with_context(|| format!("reading {}", path.display())),
            };
            if chunk.is_empty() {
                break Ok(());
            }
            offset += chunk.len() as i64;
            if json {
                content.extend_from_slice(&chunk);
            } else if let Err(e) = stdout.write_all(&chunk) {
                break Err(e.into());
            }
        };

        if let Err(e) = fs.release(&path, &fi) {
            debug!(error = %e, "release failed");
        }
        result.map(|()| content)
    })
    .await?;

    if json {
        return print_json(&CatOutput {
            path: args.path.display().to_string(),
            size: collected.len(),
            content: String::from_utf8_lossy(&collected).into_owned(),
        });
    }
    std::io::stdout().flush()?;
    Ok(())
}

pub async fn cmd_df(args: PathArgs) -> Result<()> {
    let path = args.path.clone();
    let st = with_remote(&args, move |fs| {
        fs.statfs(&path)
            .with_context(|| format!("statfs {}", path.display()))
    })
    .await?;

    let info = df_info(&args.path, &st);
    if args.json {
        return print_json(&info);
    }
    let used = info.total_bytes.saturating_sub(info.free_bytes);
    let use_pct = if info.total_bytes == 0 {
        0
    } else {
        used * 100 / info.total_bytes
    };
    println!(
        "{:<20} {:>16} {:>16} {:>16} {:>5}",
        "PATH", "SIZE", "USED", "AVAIL", "USE%"
    );
    println!(
        "{:<20} {:>16} {:>16} {:>16} {:>4}%",
        info.path, info.total_bytes, used, info.avail_bytes, use_pct
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(libc::S_IFDIR | 0o755), "drwxr-xr-x");
        assert_eq!(mode_string(libc::S_IFREG | 0o640), "-rw-r-----");
        assert_eq!(mode_string(libc::S_IFLNK | 0o777), "lrwxrwxrwx");
    }

    #[test]
    fn test_kind() {
        assert_eq!(kind(libc::S_IFREG | 0o644), "file");
        assert_eq!(kind(libc::S_IFDIR), "directory");
        assert_eq!(kind(0), "unknown");
    }

    #[test]
    fn test_df_uses_fragment_size() {
        let st = FsStat {
            bsize: 4096,
            frsize: 1024,
            blocks: 100,
            bfree: 40,
            bavail: 30,
            ..Default::default()
        };
        let info = df_info(Path::new("/"), &st);
        assert_eq!(info.total_bytes, 102_400);
        assert_eq!(info.free_bytes, 40_960);
        assert_eq!(info.avail_bytes, 30_720);
    }

    #[test]
    fn test_stat_info_json_fields() {
        let st = FileStat {
            ino: 7,
            mode: libc::S_IFREG | 0o644,
            size: 12,
            ..Default::default()
        };
        let json = serde_json::to_value(stat_info(Path::new("/tmp/a"), &st)).unwrap();
        assert_eq!(json["path"], "/tmp/a");
        assert_eq!(json["kind"], "file");
        assert_eq!(json["mode"], "-rw-r--r--");
        assert_eq!(json["size"], 12);
    }
}
