use clap::Parser;
use h5mbl_core::ModelKind;

#[derive(Parser, Debug)]
#[command(name = "h5mbl", about = "Merge many-body localization result files into aggregated archives")]
pub struct Cli {
    /// Source root directory; repeat for several. Relative names resolve
    /// against the working directory and may be a glob-like prefix.
    #[arg(short = 's', long = "src", value_name = "DIR", required = true)]
    pub src: Vec<String>,

    /// Target directory
    #[arg(short = 't', long = "tgt", value_name = "DIR", default_value = ".")]
    pub tgt: String,

    /// Target filename
    #[arg(short = 'n', long = "name", value_name = "NAME", default_value = "merged.h5")]
    pub name: String,

    /// Model variant, selects the key set
    #[arg(short = 'M', long = "model", value_enum, default_value_t = ModelArg::Sdual)]
    pub model: ModelArg,

    /// Skip simulations that have not set common/finished_all
    #[arg(short = 'f', long = "finished")]
    pub finished: bool,

    /// Replace the target instead of extending it
    #[arg(short = 'r', long = "replace")]
    pub replace: bool,

    /// Stage the target under the system temp dir, move it on success
    #[arg(short = 'T', long = "temp")]
    pub temp: bool,

    /// Max files merged per parameter set
    #[arg(short = 'm', long = "max-files", value_name = "N")]
    pub max_files: Option<u64>,

    /// Max parameter sets
    #[arg(short = 'd', long = "max-dirs", value_name = "N")]
    pub max_dirs: Option<u64>,

    /// Lowest seed to merge
    #[arg(long = "minseed", value_name = "N")]
    pub minseed: Option<i64>,

    /// Highest seed to merge
    #[arg(long = "maxseed", value_name = "N")]
    pub maxseed: Option<i64>,

    /// Merge only source paths matching this regex
    #[arg(long = "inc", value_name = "REGEX")]
    pub inc: Option<String>,

    /// Skip source paths matching this regex
    #[arg(long = "exc", value_name = "REGEX")]
    pub exc: Option<String>,

    /// Collect external links to per-directory merged files instead of
    /// merging
    #[arg(short = 'l', long = "link")]
    pub link: bool,

    /// App log verbosity, 0 (trace) to 5 (off); 2 is info
    #[arg(short = 'v', long = "verbosity", value_name = "LEVEL", default_value_t = 2)]
    pub verbosity: u8,

    /// Container-layer log verbosity on the same scale
    #[arg(short = 'V', long = "store-verbosity", value_name = "LEVEL", default_value_t = 3)]
    pub store_verbosity: u8,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ModelArg {
    Sdual,
    Lbit,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Sdual => ModelKind::Sdual,
            ModelArg::Lbit => ModelKind::Lbit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_usual_invocation() {
        let cli = Cli::try_parse_from([
            "h5mbl", "-s", "corpusA", "-s", "corpusB", "-t", "out", "-n", "merged.h5", "-M",
            "lbit", "-f", "-r", "-m", "5000", "--minseed", "50", "--maxseed", "150", "--exc",
            "broken",
        ])
        .unwrap();
        assert_eq!(cli.src, ["corpusA", "corpusB"]);
        assert_eq!(cli.tgt, "out");
        assert!(matches!(cli.model, ModelArg::Lbit));
        assert!(cli.finished && cli.replace);
        assert_eq!(cli.max_files, Some(5000));
        assert_eq!((cli.minseed, cli.maxseed), (Some(50), Some(150)));
        assert_eq!(cli.exc.as_deref(), Some("broken"));
    }

    #[test]
    fn sources_are_required() {
        assert!(Cli::try_parse_from(["h5mbl"]).is_err());
    }
}
