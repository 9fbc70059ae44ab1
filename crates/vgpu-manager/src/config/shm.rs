use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct ShowShmArgs {
    #[arg(
        help = "Shared region file, e.g. /tmp/vgpu/containers/<pod-uid>_<container>/<id>.cache",
        value_hint = clap::ValueHint::FilePath
    )]
    pub path: PathBuf,

    #[arg(long, help = "Print every occupied process slot")]
    pub processes: bool,
}
