//! Background process control for `server start|stop|restart|status`.

use anyhow::{Context, Result};
#[cfg(unix)]
use daemonize::Daemonize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{Pid, System};

use crate::config;

/// The PID file of the background server.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// The PID file in the platform data directory.
    pub fn locate() -> Result<Self> {
        let dirs = config::project_dirs()?;
        let data_dir = dirs.data_local_dir();
        fs::create_dir_all(data_dir)?;
        Ok(PidFile::at(data_dir.join("server.pid")))
    }

    pub fn at(path: PathBuf) -> Self {
        PidFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded PID, if the file exists.
    pub fn read(&self) -> Result<Option<u32>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        let pid = text
            .trim()
            .parse()
            .with_context(|| format!("invalid PID file {}", self.path.display()))?;
        Ok(Some(pid))
    }

    /// Records the PID of the running server.
    pub fn write(&self, pid: u32) -> Result<()> {
        fs::write(&self.path, format!("{}\n", pid))
            .with_context(|| format!("writing PID file {}", self.path.display()))
    }

    /// The recorded PID, only while that process is alive.
    pub fn live_pid(&self) -> Result<Option<u32>> {
        let Some(pid) = self.read()? else {
            return Ok(None);
        };
        let system = System::new_all();
        Ok(system.process(Pid::from_u32(pid)).map(|_| pid))
    }
}

/// Detaches and relaunches this executable as `server run`.
pub fn start(pid_file: &PidFile) -> Result<()> {
    if let Some(pid) = pid_file.live_pid()? {
        println!("Server is already running with PID: {}", pid);
        return Ok(());
    }

    let myself = std::env::current_exe()?;
    println!("Starting server in the background...");

    #[cfg(unix)]
    {
        // The detached process only launches the server, so the file names the server.
        match Daemonize::new().start() {
            Ok(_) => {
                let child = Command::new(&myself).arg("server").arg("run").spawn()?;
                pid_file.write(child.id())?;
            }
            Err(e) => eprintln!("Error, failed to daemonize: {}", e),
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        let child = Command::new(&myself)
            .arg("server")
            .arg("run")
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()?;
        pid_file.write(child.id())?;
    }

    println!("Server started. PID file at: {}", pid_file.path().display());
    Ok(())
}

pub fn stop(pid_file: &PidFile) -> Result<()> {
    let Some(pid) = pid_file.read()? else {
        println!("Server is not running (no PID file).");
        return Ok(());
    };

    let system = System::new_all();
    match system.process(Pid::from_u32(pid)) {
        Some(process) => {
            println!("Stopping server process with PID: {}", pid);
            process.kill();
        }
        None => println!("Process with PID {} not found. It may have already stopped.", pid),
    }
    fs::remove_file(pid_file.path())?;
    println!("Server stopped.");
    Ok(())
}

pub fn status(pid_file: &PidFile) -> Result<()> {
    match pid_file.live_pid()? {
        Some(pid) => println!("Server is running with PID: {}", pid),
        None => println!("Server is not running."),
    }
    Ok(())
}
