//! A shell script standing in for the compute engine.

use crate::errors::ExpflowResult;
use std::path::{Path, PathBuf};

/// File the fake engine appends one line per invocation to, next to the script.
pub const CALL_LOG: &str = "engine-calls.log";

/// POSIX shell engine.
///
/// It accepts the engine's flags, appends `<task> <state>` to [`CALL_LOG`],
/// writes its metadata document and a small destination file, and exits 1
/// when the artifact path contains `broken`.
pub const FAKE_ENGINE_SCRIPT: &str = r##"#!/bin/sh
meta=""; dest=""; task=""; jar=""; state=""
while [ $# -gt 0 ]; do
  case "$1" in
    --algorithm-jar) jar="$2"; shift 2 ;;
    --meta-data) meta="$2"; shift 2 ;;
    --dest) dest="$2"; shift 2 ;;
    --generate-state) task="generate-state"; state="$2"; shift 2 ;;
    --encode|--predict|--performance-test|--audit) task="${1#--}"; shift ;;
    --algorithm-definition|--source|--parameters|--dest-schema-description|--max-threads|--queue-length|--batch-size|--samples) shift 2 ;;
    *) echo "unknown argument $1" >&2; exit 2 ;;
  esac
done
case "$jar" in
  *broken*) echo "cannot load algorithm from $jar" >&2; exit 1 ;;
esac
echo "$task $state" >> "$(dirname "$0")/engine-calls.log"
if [ -n "$dest" ]; then
  mkdir -p "$(dirname "$dest")"
  if [ "$task" = "predict" ]; then
    printf '{"id":1,"score":0.25}\n{"id":2,"score":0.75}\n' > "$dest"
  else
    printf '{"task":"%s","state":"%s"}\n' "$task" "$state" > "$dest"
  fi
fi
if [ -n "$meta" ]; then
  mkdir -p "$(dirname "$meta")"
  if [ "$task" = "performance-test" ]; then
    printf '{"task":"%s","response_time_metrics":{"p50":{"mean":1.5},"p99":{"mean":4.0}}}\n' "$task" > "$meta"
  else
    printf '{"task":"%s","state":"%s"}\n' "$task" "$state" > "$meta"
  fi
fi
"##;

/// Writes the fake engine into `dir` and returns the command prefix running it.
pub fn install_fake_engine(dir: &Path) -> ExpflowResult<Vec<String>> {
    std::fs::create_dir_all(dir)?;
    let script = dir.join("fake-engine.sh");
    std::fs::write(&script, FAKE_ENGINE_SCRIPT)?;
    Ok(vec!["sh".to_string(), script.display().to_string()])
}

/// Lines the fake engine installed in `dir` has logged, in call order.
pub fn engine_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(call_log(dir))
        .map(|text| text.lines().map(|l| l.trim_end().to_string()).collect())
        .unwrap_or_default()
}

fn call_log(dir: &Path) -> PathBuf {
    dir.join(CALL_LOG)
}
