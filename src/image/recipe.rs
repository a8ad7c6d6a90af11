//! Build-recipe parsing. A recipe is line oriented: one directive per line,
//! `#` starts a comment, blank lines are skipped. `FROM` names the base
//! image; every other directive either adjusts the image's default run
//! options or produces a new layer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    From(String),
    Run(String),
    Env(Vec<String>),
    Workdir(String),
    Expose(Vec<String>),
    Cmd(Vec<String>),
    Copy { src: PathBuf, dst: String },
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::From(_) => "FROM",
            Instruction::Run(_) => "RUN",
            Instruction::Env(_) => "ENV",
            Instruction::Workdir(_) => "WORKDIR",
            Instruction::Expose(_) => "EXPOSE",
            Instruction::Cmd(_) => "CMD",
            Instruction::Copy { .. } => "COPY",
        }
    }
}

#[derive(Debug, Default)]
pub struct Recipe {
    pub base_tag: String,
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    pub fn parse_file(context_dir: &Path, file: &str) -> Result<Recipe> {
        let path = context_dir.join(file);
        let content =
            fs::read_to_string(&path).with_context(|| format!("open recipe {}", path.display()))?;
        Self::parse(&content, context_dir)
    }

    pub fn parse(content: &str, context_dir: &Path) -> Result<Recipe> {
        let mut recipe = Recipe::default();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let instruction =
                parse_line(line, context_dir).with_context(|| format!("line {}", index + 1))?;
            if let Instruction::From(tag) = &instruction {
                recipe.base_tag = tag.clone();
            }
            recipe.instructions.push(instruction);
        }

        log::debug!(
            "recipe parsed: base {}, {} instructions",
            recipe.base_tag,
            recipe.instructions.len()
        );
        Ok(recipe)
    }
}

fn parse_line(line: &str, context_dir: &Path) -> Result<Instruction> {
    let (head, args) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => bail!("invalid instruction format: {line}"),
    };
    if args.is_empty() {
        bail!("invalid instruction format: {line}");
    }

    match head.to_uppercase().as_str() {
        "FROM" => Ok(Instruction::From(args.to_string())),
        "RUN" => Ok(Instruction::Run(args.to_string())),
        "WORKDIR" => Ok(Instruction::Workdir(args.to_string())),
        "ENV" => parse_env(args),
        "EXPOSE" => Ok(Instruction::Expose(
            args.split_whitespace().map(str::to_string).collect(),
        )),
        "CMD" => parse_cmd(args),
        "COPY" => parse_copy(args, context_dir),
        other => bail!("unsupported instruction: {other}"),
    }
}

fn parse_env(args: &str) -> Result<Instruction> {
    let entries: Vec<String> = args.split_whitespace().map(str::to_string).collect();
    for entry in &entries {
        if !entry.contains('=') {
            bail!("invalid environment entry {entry}");
        }
    }
    Ok(Instruction::Env(entries))
}

/// Only the exec form `["cmd", "arg"]` is accepted; the shell form would
/// need a shell to re-split it at run time.
fn parse_cmd(args: &str) -> Result<Instruction> {
    let args = args.trim();
    if !(args.starts_with('[') && args.ends_with(']')) {
        bail!("CMD requires exec form [\"cmd\", \"arg\", ...]");
    }

    let inner = &args[1..args.len() - 1];
    let cmd: Vec<String> = inner
        .split(',')
        .map(|part| part.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|part| !part.is_empty())
        .collect();
    Ok(Instruction::Cmd(cmd))
}

fn parse_copy(args: &str, context_dir: &Path) -> Result<Instruction> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() != 2 {
        bail!("COPY requires exactly src and dst");
    }

    let src = PathBuf::from(parts[0]);
    let src = if src.is_absolute() {
        src
    } else {
        context_dir.join(src)
    };
    Ok(Instruction::Copy {
        src,
        dst: parts[1].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_recipe() {
        let content = "FROM alpine:latest\nENV A=1\nCMD [\"/bin/echo\",\"hi\"]\n";
        let recipe = Recipe::parse(content, Path::new("/ctx")).expect("parse recipe");

        assert_eq!(recipe.base_tag, "alpine:latest");
        assert_eq!(
            recipe.instructions,
            vec![
                Instruction::From("alpine:latest".to_string()),
                Instruction::Env(vec!["A=1".to_string()]),
                Instruction::Cmd(vec!["/bin/echo".to_string(), "hi".to_string()]),
            ]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let content = "# base\n\nFROM alpine\n   \n# done\n";
        let recipe = Recipe::parse(content, Path::new("/ctx")).unwrap();
        assert_eq!(recipe.instructions.len(), 1);
    }

    #[test]
    fn test_shell_form_cmd_rejected() {
        let err = Recipe::parse("CMD echo hi", Path::new("/ctx")).unwrap_err();
        assert!(format!("{err:#}").contains("exec form"));
    }

    #[test]
    fn test_malformed_env_rejected() {
        let err = Recipe::parse("ENV A=1 BROKEN", Path::new("/ctx")).unwrap_err();
        assert!(format!("{err:#}").contains("BROKEN"));
    }

    #[test]
    fn test_copy_joins_relative_source_with_context() {
        let recipe = Recipe::parse("COPY app /srv/app", Path::new("/build/ctx")).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Copy {
                src: PathBuf::from("/build/ctx/app"),
                dst: "/srv/app".to_string(),
            }
        );
    }

    #[test]
    fn test_copy_keeps_absolute_source() {
        let recipe = Recipe::parse("COPY /abs/app /srv", Path::new("/build/ctx")).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Copy {
                src: PathBuf::from("/abs/app"),
                dst: "/srv".to_string(),
            }
        );
    }

    #[test]
    fn test_copy_wrong_arity_rejected() {
        assert!(Recipe::parse("COPY onlyone", Path::new("/ctx")).is_err());
        assert!(Recipe::parse("COPY a b c", Path::new("/ctx")).is_err());
    }

    #[test]
    fn test_unsupported_instruction_rejected() {
        let err = Recipe::parse("ENTRYPOINT [\"/bin/sh\"]", Path::new("/ctx")).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported instruction"));
    }

    #[test]
    fn test_expose_splits_tokens() {
        let recipe = Recipe::parse("EXPOSE 80 443/udp", Path::new("/ctx")).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Expose(vec!["80".to_string(), "443/udp".to_string()])
        );
    }

    #[test]
    fn test_cmd_single_quotes_and_spaces() {
        let recipe = Recipe::parse("CMD [ '/bin/sh', '-c', 'true' ]", Path::new("/ctx")).unwrap();
        assert_eq!(
            recipe.instructions[0],
            Instruction::Cmd(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "true".to_string()
            ])
        );
    }
}
