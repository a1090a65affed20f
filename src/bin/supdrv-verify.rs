//! Developer tool: run the module signature verifier against a file.
//!
//! Exercises the exact code path the driver uses to admit a module, so a
//! signing or packaging problem shows up on the command line before it
//! shows up as a refused load.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use supdrv::loader::{elf, ImageLoader, ImageVerifier};
use supdrv::TrustStore;

#[derive(Parser)]
#[command(name = "supdrv-verify", version, about = "Verify a signed support-driver module image")]
struct Args {
    /// The module file to verify.
    module: PathBuf,

    /// DER-encoded trust anchor; may be given more than once.
    #[arg(long = "root", required = true)]
    roots: Vec<PathBuf>,

    /// DER-encoded supplemental anchor, consulted after the roots.
    #[arg(long = "supplemental")]
    supplemental: Vec<PathBuf>,

    /// Also check the computed in-memory image size against this value.
    #[arg(long)]
    expected_size: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => {
            println!("ok: {}", args.module.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("verification failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> supdrv::Result<()> {
    let mut builder = TrustStore::builder();
    for root in &args.roots {
        builder = builder.add_anchor_der(&std::fs::read(root)?)?;
    }
    let trust = Arc::new(builder.build());

    let supplemental = if args.supplemental.is_empty() {
        None
    } else {
        let mut builder = TrustStore::builder();
        for path in &args.supplemental {
            builder = builder.add_anchor_der(&std::fs::read(path)?)?;
        }
        Some(Arc::new(builder.build()))
    };

    let data = ImageLoader::read_module_file(&args.module)?;
    let name = args
        .module
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());

    let signature = elf::signature_der(&data)?;
    let payload = elf::signed_payload(&data)?;
    ImageVerifier::new(trust, supplemental).verify(&name, &payload, &signature)?;

    let size = elf::image_size(&data)?;
    println!("image size: {size} bytes");
    if let Some(expected) = args.expected_size {
        if size != expected {
            return Err(supdrv::Error::LoaderMismatch(format!(
                "computed image size {size} differs from expected {expected}"
            )));
        }
    }
    Ok(())
}
