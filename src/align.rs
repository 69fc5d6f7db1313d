//! External aligner invocation and Clustal alignment reading.
use crate::error::PipelineError;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

/// Supported aligners. Selected once when the configuration is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aligner {
    #[serde(alias = "clustalw2")]
    ClustalW,
    Mafft,
    ProbCons,
}

/// How a `key -> value` parameter becomes argv.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagStyle {
    /// `-KEY=value` as one argument.
    Joined,
    /// `--key value` as two arguments.
    Separate,
}

/// A fully resolved aligner invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlignerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Aligners that print the alignment on stdout get it written here.
    pub stdout_to: Option<PathBuf>,
}

impl Aligner {
    pub fn name(&self) -> &'static str {
        match self {
            Aligner::ClustalW => "clustalw",
            Aligner::Mafft => "mafft",
            Aligner::ProbCons => "probcons",
        }
    }

    pub fn env_var(&self) -> &'static str {
        match self {
            Aligner::ClustalW => "CLUSTALW_BIN",
            Aligner::Mafft => "MAFFT_BIN",
            Aligner::ProbCons => "PROBCONS_BIN",
        }
    }

    pub fn flag_style(&self) -> FlagStyle {
        match self {
            Aligner::ClustalW => FlagStyle::Joined,
            Aligner::Mafft | Aligner::ProbCons => FlagStyle::Separate,
        }
    }

    pub fn program(&self) -> String {
        std::env::var(self.env_var())
            .ok()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.name().to_owned())
    }

    /// Formats the configured parameters. `true` becomes a bare flag, `null`
    /// is left out, anything else (`false` included) carries its value.
    pub fn format_parameters(&self, params: &Map<String, Value>) -> Vec<String> {
        let mut out = Vec::with_capacity(params.len());
        for (key, value) in params {
            let value = match value {
                Value::Bool(true) => {
                    out.push(key.clone());
                    continue;
                }
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match self.flag_style() {
                FlagStyle::Joined => out.push(format!("{key}={value}")),
                FlagStyle::Separate => {
                    out.push(key.clone());
                    out.push(value);
                }
            }
        }
        out
    }

    /// Builds the command line aligning `input` into `output` (Clustal
    /// format for every aligner).
    pub fn command(
        &self,
        program: Option<&str>,
        params: &Map<String, Value>,
        input: &Path,
        output: &Path,
    ) -> AlignerCommand {
        let program = program.map(ToOwned::to_owned).unwrap_or_else(|| self.program());
        let mut args = self.format_parameters(params);
        let stdout_to = match self {
            Aligner::ClustalW => {
                args.push(format!("-INFILE={}", input.display()));
                args.push(format!("-OUTFILE={}", output.display()));
                None
            }
            Aligner::Mafft => {
                args.push("--clustalout".to_owned());
                args.push(input.display().to_string());
                Some(output.to_path_buf())
            }
            Aligner::ProbCons => {
                args.push("-clustalw".to_owned());
                args.push(input.display().to_string());
                Some(output.to_path_buf())
            }
        };
        AlignerCommand {
            program,
            args,
            stdout_to,
        }
    }
}

/// Runs one aligner invocation for `input`. A non-zero exit fails the
/// item; stderr output on success is only logged.
pub fn run(aligner: Aligner, cmd: &AlignerCommand, input: &Path) -> Result<(), PipelineError> {
    let fail = |message: String| PipelineError::ExternalProcess {
        aligner: aligner.name().to_owned(),
        input: input.to_path_buf(),
        message,
    };
    debug!("{} {}", cmd.program, cmd.args.join(" "));
    let output = Command::new(&cmd.program)
        .args(&cmd.args)
        .output()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                fail(format!("executable '{}' not found", cmd.program))
            } else {
                fail(format!("could not run '{}': {e}", cmd.program))
            }
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !output.status.success() {
        return Err(fail(format!("{} ({stderr})", output.status)));
    }
    if !stderr.is_empty() {
        warn!("{} on {}: {stderr}", aligner.name(), input.display());
    }
    if let Some(path) = &cmd.stdout_to {
        fs::write(path, &output.stdout).map_err(|e| PipelineError::io(path, e))?;
    }
    Ok(())
}

/// Aligned sequences, one row per record, all rows the same length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alignment {
    pub ids: Vec<String>,
    pub rows: Vec<Vec<u8>>,
}

impl Alignment {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn columns(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

/// Parses Clustal (`.aln`) text: a header line, then blocks of
/// `id  residues [count]` lines separated by blank and consensus lines.
pub fn parse_clustal(text: &str) -> Result<Alignment> {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
    let header = lines.next().context("empty alignment")?;
    if !header.trim_start().starts_with("CLUSTAL") && !header.contains("multiple sequence alignment") {
        bail!("not a Clustal alignment (header: {header:?})");
    }

    let mut ids: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<u8>> = Vec::new();
    let mut index = std::collections::HashMap::<String, usize>::new();
    for line in lines {
        // consensus lines start with whitespace, blocks are blank-separated
        if line.trim().is_empty() || line.starts_with(char::is_whitespace) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(id), Some(chunk)) = (fields.next(), fields.next()) else {
            bail!("malformed alignment line {line:?}");
        };
        let slot = *index.entry(id.to_owned()).or_insert_with(|| {
            ids.push(id.to_owned());
            rows.push(Vec::new());
            rows.len() - 1
        });
        rows[slot].extend_from_slice(chunk.as_bytes());
    }

    if let Some(first) = rows.first() {
        let width = first.len();
        if let Some((i, _)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            bail!("row {} has length {}, expected {width}", ids[i], rows[i].len());
        }
    }
    Ok(Alignment { ids, rows })
}

pub fn read_clustal(path: &Path) -> Result<Alignment> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read alignment {}", path.display()))?;
    parse_clustal(&text).with_context(|| format!("parse alignment {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Map<String, Value> {
        serde_json::from_str(
            r#"{"-TYPE": "PROTEIN", "-ALIGN": true, "-GAPOPEN": 10.5, "-QUIET": false}"#,
        )
        .unwrap()
    }

    #[test]
    fn clustalw_joins_key_and_value() {
        let cmd = Aligner::ClustalW.command(
            Some("clustalw"),
            &params(),
            Path::new("in/a.fasta"),
            Path::new("tmp/a.aln"),
        );
        assert_eq!(
            cmd.args,
            vec![
                "-TYPE=PROTEIN",
                "-ALIGN",
                "-GAPOPEN=10.5",
                "-QUIET=false",
                "-INFILE=in/a.fasta",
                "-OUTFILE=tmp/a.aln"
            ]
        );
        assert_eq!(cmd.stdout_to, None);
    }

    #[test]
    fn mafft_separates_key_and_value_and_captures_stdout() {
        let p: Map<String, Value> =
            serde_json::from_str(r#"{"--maxiterate": 1000, "--localpair": true}"#).unwrap();
        let cmd = Aligner::Mafft.command(Some("mafft"), &p, Path::new("a.fa"), Path::new("a.aln"));
        assert_eq!(
            cmd.args,
            vec!["--maxiterate", "1000", "--localpair", "--clustalout", "a.fa"]
        );
        assert_eq!(cmd.stdout_to.as_deref(), Some(Path::new("a.aln")));
    }

    #[test]
    fn probcons_asks_for_clustal_output() {
        let p: Map<String, Value> = serde_json::from_str(r#"{"-c": 2}"#).unwrap();
        let cmd = Aligner::ProbCons.command(Some("probcons"), &p, Path::new("a.fa"), Path::new("a.aln"));
        assert_eq!(cmd.args, vec!["-c", "2", "-clustalw", "a.fa"]);
    }

    #[test]
    fn aligner_names_deserialize() {
        let a: Aligner = serde_json::from_str("\"clustalw\"").unwrap();
        assert_eq!(a, Aligner::ClustalW);
        let a: Aligner = serde_json::from_str("\"clustalw2\"").unwrap();
        assert_eq!(a, Aligner::ClustalW);
        let a: Aligner = serde_json::from_str("\"probcons\"").unwrap();
        assert_eq!(a, Aligner::ProbCons);
        assert!(serde_json::from_str::<Aligner>("\"muscle\"").is_err());
    }

    #[test]
    fn clustal_blocks_are_concatenated() {
        let text = "CLUSTAL 2.1 multiple sequence alignment\n\n\
                    seqA      MKV-LA 5\n\
                    seqB      MKVQLA 6\n\
                    \x20         ***.**\n\n\
                    seqA      GG\n\
                    seqB      G-\n";
        let aln = parse_clustal(text).unwrap();
        assert_eq!(aln.ids, vec!["seqA", "seqB"]);
        assert_eq!(aln.rows[0], b"MKV-LAGG".to_vec());
        assert_eq!(aln.rows[1], b"MKVQLAG-".to_vec());
        assert_eq!(aln.columns(), 8);
    }

    #[test]
    fn ragged_alignment_rejected() {
        let text = "CLUSTAL W\n\nx AAA\ny AA\n";
        assert!(parse_clustal(text).is_err());
        assert!(parse_clustal(">x\nAAA\n").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn stderr_is_logged_and_exit_status_decides() {
        let noisy = AlignerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'WARNING: short seq' >&2; exit 0".into()],
            stdout_to: None,
        };
        let input = Path::new("P0.fasta");
        for aligner in [Aligner::ClustalW, Aligner::Mafft, Aligner::ProbCons] {
            assert!(run(aligner, &noisy, input).is_ok(), "{aligner:?}");
        }

        let failing = AlignerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            stdout_to: None,
        };
        assert!(run(Aligner::Mafft, &failing, input).is_err());
        let err = run(Aligner::ClustalW, &failing, input).unwrap_err();
        assert!(err.is_fatal());

        let missing = AlignerCommand {
            program: "definitely-not-an-aligner-binary".into(),
            args: Vec::new(),
            stdout_to: None,
        };
        let err = run(Aligner::ProbCons, &missing, input).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_is_written_for_capturing_aligners() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a.aln");
        let cmd = AlignerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "printf 'CLUSTAL\\n\\na AC\\nb AG\\n'".into()],
            stdout_to: Some(out.clone()),
        };
        run(Aligner::ProbCons, &cmd, Path::new("a.fa")).unwrap();
        let aln = read_clustal(&out).unwrap();
        assert_eq!(aln.len(), 2);
    }
}
