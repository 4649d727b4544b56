//! File loaders for event logs and DAG definitions.

use std::path::{Path, PathBuf};

use taskloom_types::dag::DagDefinition;
use taskloom_types::event::DagInstanceEvent;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in '{path}' at line {line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in '{path}': {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

async fn read(path: &Path) -> Result<String, LoadError> {
    tokio::fs::read_to_string(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a run's event log.
///
/// Accepts a JSON array of events or JSON Lines (one event per line, blank
/// lines ignored).
pub async fn load_event_log(path: &Path) -> Result<Vec<DagInstanceEvent>, LoadError> {
    let content = read(path).await?;
    let events = parse_event_log(&content).map_err(|(line, source)| LoadError::Json {
        path: path.to_path_buf(),
        line,
        source,
    })?;
    tracing::debug!(path = %path.display(), count = events.len(), "event log loaded");
    Ok(events)
}

fn parse_event_log(content: &str) -> Result<Vec<DagInstanceEvent>, (usize, serde_json::Error)> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content).map_err(|e| (e.line(), e));
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| serde_json::from_str(line).map_err(|e| (i + 1, e)))
        .collect()
}

/// Load a DAG definition, choosing the format by extension.
///
/// `.json` is parsed as JSON; anything else as YAML.
pub async fn load_dag_definition(path: &Path) -> Result<DagDefinition, LoadError> {
    let content = read(path).await?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let definition = if is_json {
        DagDefinition::from_json(&content).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            line: source.line(),
            source,
        })?
    } else {
        DagDefinition::from_yaml(&content).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };
    tracing::debug!(path = %path.display(), dag_id = %definition.id, steps = definition.steps.len(), "DAG definition loaded");
    Ok(definition)
}
