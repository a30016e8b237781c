use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use vmm::config::VMMConfig;
use vmm::VMM;
use vmm_sys_util::terminal::Terminal;

/// Exit code the help flag is documented to use.
const HELP_EXIT_CODE: i32 = 123;

#[derive(Parser)]
#[command(name = "kvm-host", disable_version_flag = true)]
struct VMMOpts {
    /// Linux kernel path
    #[arg(short, long)]
    kernel: String,

    /// Initial RAM disk image
    #[arg(short, long)]
    initrd: Option<String>,

    /// Disk image for the virtio-blk device
    #[arg(short, long)]
    disk: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    VmmNew(vmm::Error),

    VmmConfigure(vmm::Error),

    VmmRun(vmm::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::VmmNew(e) => write!(f, "Failed to initialize guest vm: {}", e),
            Error::VmmConfigure(e) => write!(f, "Failed to configure guest vm: {}", e),
            Error::VmmRun(e) => write!(f, "Failed to run guest vm: {}", e),
        }
    }
}

/// One stderr line, with every cause down to the OS error text.
fn report(err: &Error) {
    let mut line = err.to_string();
    let inner: &vmm::Error = match err {
        Error::VmmNew(e) | Error::VmmConfigure(e) | Error::VmmRun(e) => e,
    };
    let mut source = inner.source();
    while let Some(cause) = source {
        line.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    eprintln!("kvm-host: {}", line);
}

fn run(opts: VMMOpts) -> Result<(), Error> {
    let config = VMMConfig::builder(opts.kernel)
        .initrd(opts.initrd.map(Into::into))
        .disk(opts.disk.map(Into::into))
        .build();

    // Create and wire up the VMM, then give it the boot artifacts.
    let mut vmm = VMM::new().map_err(Error::VmmNew)?;
    vmm.configure(&config).map_err(Error::VmmConfigure)?;

    let result = vmm.run().map_err(Error::VmmRun);
    vmm.shutdown();
    result
}

fn main() {
    env_logger::init();

    let opts = match VMMOpts::try_parse() {
        Ok(opts) => opts,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => {
            let _ = e.print();
            process::exit(HELP_EXIT_CODE);
        }
        // Prints usage and exits non-zero.
        Err(e) => e.exit(),
    };

    // The guest console takes over stdin; it has to be a real terminal.
    if unsafe { libc::isatty(libc::STDIN_FILENO) } == 0 {
        eprintln!("Not a terminal.");
        process::exit(1);
    }
    if let Err(e) = io::stdin().lock().set_raw_mode() {
        eprintln!("kvm-host: failed to set raw terminal mode: {}", e);
        process::exit(1);
    }

    let result = run(opts);

    let _ = io::stdin().lock().set_canon_mode();
    if let Err(err) = result {
        report(&err);
        process::exit(1);
    }
}
