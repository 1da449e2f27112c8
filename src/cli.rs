//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use resilience_probe::ScenarioKind;

/// Scenario selectable on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentArg {
    /// Recreate every VM under a running measurer
    Recreate,
    /// Isolate one zone and restart every node
    ZonePartition,
    /// Isolate one zone and probe the isolated node and the survivors
    TargetedPartition,
    /// Isolate two zones, then heal one at a time
    FullPartition,
}

impl From<ExperimentArg> for ScenarioKind {
    fn from(arg: ExperimentArg) -> Self {
        match arg {
            ExperimentArg::Recreate => Self::Recreate,
            ExperimentArg::ZonePartition => Self::ZonePartition,
            ExperimentArg::TargetedPartition => Self::TargetedPartition,
            ExperimentArg::FullPartition => Self::FullPartition,
        }
    }
}

/// Measure key-value cluster availability under injected faults.
///
/// Runs the selected experiments in order (all of them when none is given)
/// and exits non-zero when any experiment fails.
#[derive(Parser, Debug)]
#[command(name = "resilience-probe")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Experiment to run; repeat to run several
    #[arg(short = 'e', long = "experiment", value_enum)]
    pub experiments: Vec<ExperimentArg>,
}

impl Args {
    /// Scenarios to run, in command-line order.
    pub fn scenarios(&self) -> Vec<ScenarioKind> {
        if self.experiments.is_empty() {
            ScenarioKind::ALL.to_vec()
        } else {
            self.experiments.iter().copied().map(Into::into).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_only_runs_every_scenario() {
        let args = Args::try_parse_from(["resilience-probe", "--config", "probe.json"]).unwrap();
        assert_eq!(args.config, PathBuf::from("probe.json"));
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.scenarios(), ScenarioKind::ALL.to_vec());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["resilience-probe", "-c", "p.json", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["resilience-probe", "-c", "p.json", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["resilience-probe", "-c", "p.json", "--quiet"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["resilience-probe", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err =
            Args::try_parse_from(["resilience-probe", "-c", "p.json", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    // ==================== Experiment Selection Tests ====================

    #[test]
    fn test_cli_experiments_keep_order() {
        let args = Args::try_parse_from([
            "resilience-probe",
            "-c",
            "p.json",
            "-e",
            "full-partition",
            "--experiment",
            "recreate",
        ])
        .unwrap();
        assert_eq!(
            args.scenarios(),
            vec![ScenarioKind::FullPartition, ScenarioKind::Recreate]
        );
    }

    #[test]
    fn test_cli_unknown_experiment_rejected() {
        let err = Args::try_parse_from(["resilience-probe", "-c", "p.json", "-e", "chaos"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_cli_experiment_names_match_scenarios() {
        for kind in ScenarioKind::ALL {
            let args =
                Args::try_parse_from(["resilience-probe", "-c", "p.json", "-e", kind.name()])
                    .unwrap();
            assert_eq!(args.scenarios(), vec![kind]);
        }
    }
}
