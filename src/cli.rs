//! Command-line compatibility helpers
//!
//! The extractor's flags are spelled with a single dash (`-chunksize 50`).
//! clap only parses long options with two dashes, so known single-dash long
//! flags are rewritten before parsing. Anything else passes through untouched.

use std::ffi::OsString;

/// Long flags of the `pull-traj` CLI
pub const EXTRACTOR_FLAGS: [&str; 10] = [
    "chunksize",
    "model",
    "save_partial",
    "list_models",
    "verbose",
    "maxtrajectories",
    "corpus",
    "output_dir",
    "cpu",
    "bf16",
];

/// Rewrite `-name` / `-name=value` to `--name` / `--name=value` for known names
pub fn normalize_single_dash_flags<I, T>(args: I, known: &[&str]) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(rest) = text.strip_prefix('-') else {
                return arg;
            };
            if rest.starts_with('-') {
                return arg;
            }
            let name = rest.split_once('=').map_or(rest, |(name, _)| name);
            if known.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(args: &[&str]) -> Vec<String> {
        normalize_single_dash_flags(args.iter().copied(), &EXTRACTOR_FLAGS)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_single_dash_rewritten() {
        assert_eq!(
            normalize(&["pull-traj", "-chunksize", "50", "-model", "m", "-save_partial"]),
            vec!["pull-traj", "--chunksize", "50", "--model", "m", "--save_partial"]
        );
    }

    #[test]
    fn test_equals_form() {
        assert_eq!(normalize(&["-verbose=2"]), vec!["--verbose=2"]);
    }

    #[test]
    fn test_unknown_and_double_dash_untouched() {
        assert_eq!(
            normalize(&["--chunksize", "-h", "-x", "-1", "value"]),
            vec!["--chunksize", "-h", "-x", "-1", "value"]
        );
    }
}
