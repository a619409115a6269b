//! Template compilation: every template ends up as a path to an executable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::config::TemplateConfig;
use crate::error::CompileError;

const DEFAULT_INTERPRETER: &str = "#!/bin/sh\n";

/// Template name -> executable path.
pub type TemplateTable = HashMap<String, PathBuf>;

pub fn compile_templates(
    templates: &[TemplateConfig],
    tmp_dir: &Path,
) -> Result<TemplateTable, CompileError> {
    let mut table = TemplateTable::with_capacity(templates.len());
    for tc in templates {
        if tc.name.is_empty() {
            return Err(CompileError::UnnamedTemplate);
        }
        if table.contains_key(&tc.name) {
            return Err(CompileError::DuplicateTemplate(tc.name.clone()));
        }
        let inline = tc.command.as_deref().filter(|s| !s.is_empty());
        let exec_file = tc.exec_file.as_deref().filter(|s| !s.is_empty());
        let path = match (inline, exec_file) {
            (Some(_), Some(_)) => return Err(CompileError::AmbiguousTemplate(tc.name.clone())),
            (None, None) => return Err(CompileError::EmptyTemplate(tc.name.clone())),
            (None, Some(file)) => PathBuf::from(file),
            (Some(body), None) => {
                materialize(body, tmp_dir).map_err(|source| CompileError::Materialize {
                    name: tc.name.clone(),
                    source,
                })?
            }
        };
        debug!(template = %tc.name, path = %path.display(), "compiled template");
        table.insert(tc.name.clone(), path);
    }
    Ok(table)
}

/// Write an inline body to a fresh executable file under `tmp_dir`.
/// Bodies without a shebang line run under `/bin/sh`.
fn materialize(body: &str, tmp_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(tmp_dir)?;
    let path = tmp_dir.join(format!("command-{}", Uuid::new_v4().simple()));
    let mut contents = String::with_capacity(body.len() + DEFAULT_INTERPRETER.len() + 1);
    if !body.starts_with("#!") {
        contents.push_str(DEFAULT_INTERPRETER);
    }
    contents.push_str(body);
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    std::fs::write(&path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(name: &str, body: &str) -> TemplateConfig {
        TemplateConfig {
            name: name.to_string(),
            command: Some(body.to_string()),
            exec_file: None,
        }
    }

    #[test]
    fn inline_body_is_materialized_with_shebang() {
        let dir = tempfile::tempdir().unwrap();
        let table = compile_templates(&[inline("ping", "echo pong")], dir.path()).unwrap();
        let path = &table["ping"];
        assert!(path.starts_with(dir.path()));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "#!/bin/sh\necho pong\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn existing_shebang_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let table =
            compile_templates(&[inline("py", "#!/usr/bin/env python3\nprint(1)")], dir.path())
                .unwrap();
        let contents = std::fs::read_to_string(&table["py"]).unwrap();
        assert!(contents.starts_with("#!/usr/bin/env python3\n"));
    }

    #[test]
    fn exec_file_is_referenced_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let tc = TemplateConfig {
            name: "deploy".to_string(),
            command: None,
            exec_file: Some("/usr/local/bin/deploy".to_string()),
        };
        let table = compile_templates(&[tc], dir.path()).unwrap();
        assert_eq!(table["deploy"], PathBuf::from("/usr/local/bin/deploy"));
    }

    #[test]
    fn both_or_neither_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let both = TemplateConfig {
            name: "x".to_string(),
            command: Some("echo".to_string()),
            exec_file: Some("/bin/true".to_string()),
        };
        assert!(matches!(
            compile_templates(&[both], dir.path()),
            Err(CompileError::AmbiguousTemplate(name)) if name == "x"
        ));
        let neither = TemplateConfig {
            name: "y".to_string(),
            command: Some(String::new()),
            exec_file: None,
        };
        assert!(matches!(
            compile_templates(&[neither], dir.path()),
            Err(CompileError::EmptyTemplate(name)) if name == "y"
        ));
    }

    #[test]
    fn duplicate_and_unnamed_templates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            compile_templates(&[inline("a", "true"), inline("a", "false")], dir.path()),
            Err(CompileError::DuplicateTemplate(name)) if name == "a"
        ));
        assert!(matches!(
            compile_templates(&[inline("", "true")], dir.path()),
            Err(CompileError::UnnamedTemplate)
        ));
    }
}
