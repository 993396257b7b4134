//! CLI definition and dispatch.

mod load;

use std::ffi::OsString;

use bundle_core::error::{BundleError, Result};
use bundle_runtime::LoadReport;
use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use tokio_util::sync::CancellationToken;

pub use load::LoadArgs;

/// Load an OCI source bundle image into a directory.
#[derive(Parser, Debug)]
#[command(name = "bundle", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub load: LoadArgs,
}

/// Dispatch a parsed CLI to the load command.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<LoadReport> {
    load::execute(cli.load, cancel).await
}

/// Parse `args` (program name first) and run.
///
/// `--help` and `--version` print and return `Ok(None)` without loading.
/// Any other parse failure is a usage error.
pub async fn run_from<I, T>(args: I, cancel: CancellationToken) -> Result<Option<LoadReport>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                e.print()?;
                return Ok(None);
            }
            _ => return Err(BundleError::Usage(e.to_string())),
        },
    };

    dispatch(cli, cancel).await.map(Some)
}
