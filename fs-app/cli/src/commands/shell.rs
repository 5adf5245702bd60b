//! Interactive shell over a mounted root image
//!
//! One command per line. Ctrl-C or end of input flushes every device
//! before exiting.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use extfs::{DirListing, Fd, FileSystem, FsConfig, OpenMode, Pid};

/// Mount an image as `/` and run commands against it
#[derive(Parser, Debug)]
#[command(about = "Open an image and start the interactive shell")]
pub struct ShellArgs {
    /// Image to mount as the root
    pub image: PathBuf,

    /// JSON file overriding table capacities
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

const HELP: &str = "\
cd [dir]              ls [path]             pwd
mkdir dir             rmdir dir             creat file
rm file               link old new          unlink file
symlink target link   readlink link         chmod mode path
touch path            stat path             cat file
cp src dst            mv src dst
open file mode        close fd              read fd count
write fd text...      lseek fd offset       dup fd
pfd                   mount [image dir]     umount dir
cs [pid]              ps                    sync
help                  quit";

enum Flow {
    Continue,
    Quit,
}

struct Shell {
    fs: FileSystem,
    pid: Pid,
}

pub async fn run(args: ShellArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => FsConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => FsConfig::default(),
    };

    let fs = FileSystem::open_root(&args.image, config)
        .await
        .with_context(|| format!("Failed to mount root image: {}", args.image.display()))?;

    let (tx, mut interrupts) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Root {} mounted; type 'help' for commands", args.image.display());
    let mut shell = Shell { fs, pid: 0 };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        shell.prompt().await;
        tokio::select! {
            _ = interrupts.recv() => {
                println!();
                info!("Interrupted, flushing filesystem...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else { break };
                match shell.execute(&line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => eprintln!("error: {:#}", e),
                }
            }
        }
    }

    shell.fs.shutdown().await.context("Failed to flush filesystem")?;
    println!("All devices flushed.");
    Ok(())
}

fn arg<'a>(args: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    args.get(index).copied().ok_or_else(|| anyhow!("missing argument: {}", name))
}

fn fd_arg(args: &[&str], index: usize) -> Result<Fd> {
    arg(args, index, "fd")?.parse().context("fd must be a number")
}

fn format_time(t: u32) -> String {
    DateTime::<Utc>::from_timestamp(t as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn print_listing(entry: &DirListing) {
    let st = &entry.stat;
    let target = entry.link_target.as_deref().map(|t| format!(" -> {}", t)).unwrap_or_default();
    println!(
        "{} {:>3} {:>4} {:>4} {:>8} {} {}{}",
        st.permissions(),
        st.links,
        st.uid,
        st.gid,
        st.size,
        format_time(st.mtime),
        entry.name,
        target
    );
}

impl Shell {
    async fn prompt(&self) {
        let cwd = self.fs.pwd(self.pid).await.unwrap_or_else(|_| "?".to_string());
        print!("P{}:{}$ ", self.pid, cwd);
        if let Err(e) = std::io::stdout().flush() {
            warn!("Failed to flush prompt: {}", e);
        }
    }

    async fn execute(&mut self, line: &str) -> Result<Flow> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = words.split_first() else {
            return Ok(Flow::Continue);
        };
        let pid = self.pid;
        let fs = &mut self.fs;

        match cmd {
            "cd" => fs.chdir(pid, args.first().copied().unwrap_or("/")).await?,
            "ls" => {
                for entry in fs.list_dir(pid, args.first().copied().unwrap_or(".")).await? {
                    print_listing(&entry);
                }
            }
            "pwd" => println!("{}", fs.pwd(pid).await?),
            "mkdir" => {
                fs.mkdir(pid, arg(args, 0, "dir")?).await?;
            }
            "rmdir" => fs.rmdir(pid, arg(args, 0, "dir")?).await?,
            "creat" => {
                fs.creat(pid, arg(args, 0, "file")?).await?;
            }
            "rm" => fs.rm(pid, arg(args, 0, "file")?).await?,
            "link" => fs.link(pid, arg(args, 0, "old")?, arg(args, 1, "new")?).await?,
            "unlink" => fs.unlink(pid, arg(args, 0, "file")?).await?,
            "symlink" => {
                fs.symlink(pid, arg(args, 0, "target")?, arg(args, 1, "link")?).await?;
            }
            "readlink" => println!("{}", fs.readlink(pid, arg(args, 0, "link")?).await?),
            "chmod" => {
                let mode = u16::from_str_radix(arg(args, 0, "mode")?, 8).context("mode must be octal")?;
                fs.chmod(pid, arg(args, 1, "path")?, mode).await?;
            }
            "touch" => fs.touch(pid, arg(args, 0, "path")?).await?,
            "stat" => {
                let st = fs.stat(pid, arg(args, 0, "path")?).await?;
                println!("  device: {}  inode: {}  links: {}", st.dev, st.ino, st.links);
                println!("  mode: {:o} ({})  uid: {}  gid: {}", st.mode, st.permissions(), st.uid, st.gid);
                println!("  size: {}  blocks: {}", st.size, st.blocks);
                println!("  atime: {}", format_time(st.atime));
                println!("  mtime: {}", format_time(st.mtime));
                println!("  ctime: {}", format_time(st.ctime));
            }
            "cat" => {
                let data = fs.cat(pid, arg(args, 0, "file")?).await?;
                println!("{}", String::from_utf8_lossy(&data));
            }
            "cp" => fs.copy(pid, arg(args, 0, "src")?, arg(args, 1, "dst")?).await?,
            "mv" => fs.rename(pid, arg(args, 0, "src")?, arg(args, 1, "dst")?).await?,
            "open" => {
                let mode: OpenMode = arg(args, 1, "mode")?.parse()?;
                let fd = fs.open(pid, arg(args, 0, "file")?, mode).await?;
                println!("fd {}", fd);
            }
            "close" => fs.close(pid, fd_arg(args, 0)?)?,
            "read" => {
                let count: usize = arg(args, 1, "count")?.parse().context("count must be a number")?;
                let data = fs.read(pid, fd_arg(args, 0)?, count).await?;
                println!("{}", String::from_utf8_lossy(&data));
                println!("[{} bytes]", data.len());
            }
            "write" => {
                let fd = fd_arg(args, 0)?;
                let text = args.get(1..).map(|rest| rest.join(" ")).unwrap_or_default();
                let n = fs.write(pid, fd, text.as_bytes()).await?;
                println!("[{} bytes]", n);
            }
            "lseek" => {
                let offset: u32 = arg(args, 1, "offset")?.parse().context("offset must be a number")?;
                let previous = fs.lseek(pid, fd_arg(args, 0)?, offset)?;
                println!("offset {} -> {}", previous, offset);
            }
            "dup" => println!("fd {}", fs.dup(pid, fd_arg(args, 0)?)?),
            "pfd" => {
                println!(" fd  mode    offset  inode");
                for d in fs.list_descriptors(pid)? {
                    println!("{:>3}  {:<6} {:>7}  [{}, {}] size {}", d.fd, d.mode.to_string(), d.offset, d.dev, d.ino, d.size);
                }
            }
            "mount" if args.is_empty() => {
                for m in fs.list_mounts() {
                    println!("{} {} on {}", m.device, m.image.display(), m.mount_point);
                }
            }
            "mount" => {
                let dev = fs.mount(pid, arg(args, 0, "image")?, arg(args, 1, "dir")?).await?;
                println!("mounted as {}", dev);
            }
            "umount" => fs.unmount(pid, arg(args, 0, "dir")?).await?,
            "cs" => {
                let next = match args.first() {
                    Some(p) => p.parse().context("pid must be a number")?,
                    None => (pid + 1) % fs.processes().len(),
                };
                let next = fs.switch_process(next)?;
                self.pid = next;
            }
            "ps" => {
                println!("pid  uid  gid  cwd          fds");
                for p in fs.list_processes()? {
                    let marker = if p.pid == pid { "*" } else { " " };
                    println!("{}{:<3} {:>4} {:>4}  [{}, {}] {:>4}", marker, p.pid, p.uid, p.gid, p.cwd.0, p.cwd.1, p.open_descriptors);
                }
            }
            "sync" => fs.sync().await?,
            "help" => println!("{}", HELP),
            "quit" | "exit" => return Ok(Flow::Quit),
            other => return Err(anyhow!("unknown command '{}' (try 'help')", other)),
        }
        Ok(Flow::Continue)
    }
}
