/// File compilation driver: read a script, compile it, write the executable.
use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use memmap2::Mmap;
use tracing::debug;

use crate::ast;
use crate::codegen::{self, GeneratedCode};
use crate::elf_gen;

/// Compile a script file into a standalone executable at `output`.
pub fn compile_file_to_executable(input: &str, output: &str) -> Result<()> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input))?;
    let len = file
        .metadata()
        .with_context(|| format!("cannot read {}", input))?
        .len();

    // mapping a zero-length file fails on Linux
    let mapped;
    let source: &[u8] = if len == 0 {
        &[]
    } else {
        mapped = unsafe { Mmap::map(&file) }
            .with_context(|| format!("cannot read {}", input))?;
        &mapped
    };

    let generated = compile_source(source)?;
    elf_gen::write_executable(&generated, Path::new(output))
        .with_context(|| format!("cannot write {}", output))?;
    Ok(())
}

/// Parse and lower a script source to its relocatable code image.
pub fn compile_source(source: &[u8]) -> Result<GeneratedCode> {
    let script = ast::parse(source).map_err(|e| anyhow!("parse error: {}", e))?;
    debug!(pipelines = script.pipelines.len(), "parsed script");
    Ok(codegen::generate(&script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failures_carry_the_reporting_prefix() {
        for src in [
            &b"| echo x\n"[..],
            &b"echo x |\n"[..],
            &b"> out\n"[..],
            &b"echo \"unterminated\n"[..],
            &b"echo 'unterminated\n"[..],
            &b"echo foo\\"[..],
        ] {
            let err = compile_source(src).unwrap_err();
            assert!(
                format!("{err:#}").starts_with("parse error: "),
                "unexpected rendering for {:?}: {err:#}",
                src
            );
        }
    }

    #[test]
    fn missing_input_reports_the_path() {
        let err = compile_file_to_executable("/no/such/script.sh", "/tmp/unused").unwrap_err();
        assert!(format!("{err:#}").contains("/no/such/script.sh"));
    }

    // The produced binaries are raw x86-64 Linux syscall programs; run them
    // only where they can execute.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    mod run {
        use super::super::*;
        use std::fs;
        use std::path::{Path, PathBuf};
        use std::process::{Command, Output};

        fn compile_to(dir: &Path, name: &str, source: &str) -> PathBuf {
            let script = dir.join(format!("{name}.sh"));
            fs::write(&script, source).unwrap();
            let out = dir.join(name);
            compile_file_to_executable(script.to_str().unwrap(), out.to_str().unwrap())
                .unwrap();
            out
        }

        fn run_in(dir: &Path, bin: &Path) -> Output {
            Command::new(bin).current_dir(dir).output().unwrap()
        }

        #[test]
        fn echo_writes_its_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "hello", "echo hello world\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"hello world\n");
            assert_eq!(out.status.code(), Some(0));
        }

        #[test]
        fn statements_run_in_order() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "seq", "echo a; echo b\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"a\nb\n");
        }

        #[test]
        fn quoting_controls_word_splitting() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "quotes", "echo \"a b\" 'c  d'\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"a b c  d\n");
        }

        #[test]
        fn output_redirection_truncates() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "trunc", "echo hi > out.txt\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"");
            assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"hi\n");
            // a second run must not grow the file
            run_in(dir.path(), &bin);
            assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"hi\n");

            let cat = compile_to(dir.path(), "cat-out", "cat out.txt\n");
            let out = run_in(dir.path(), &cat);
            assert_eq!(out.stdout, b"hi\n");
        }

        #[test]
        fn append_redirection_accumulates() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(
                dir.path(),
                "append",
                "echo one >> log.txt; echo two >> log.txt\n",
            );
            run_in(dir.path(), &bin);
            run_in(dir.path(), &bin);
            assert_eq!(
                fs::read(dir.path().join("log.txt")).unwrap(),
                b"one\ntwo\none\ntwo\n"
            );
        }

        #[test]
        fn input_redirection_feeds_stdin() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("in.txt"), "abc\n").unwrap();
            let bin = compile_to(dir.path(), "upper", "tr a-z A-Z < in.txt\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"ABC\n");
        }

        #[test]
        fn pipeline_feeds_the_next_stage() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "pipe", "echo abc | tr a-z A-Z\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"ABC\n");
            assert_eq!(out.status.code(), Some(0));
        }

        #[test]
        fn three_stage_pipelines_chain() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(
                dir.path(),
                "chain",
                "echo hello | tr a-z A-Z | tr A-Z a-z\n",
            );
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"hello\n");
        }

        #[test]
        fn pipeline_parent_retains_no_pipe_fds() {
            use std::io::{BufRead, BufReader, Write};
            use std::process::Stdio;
            use std::time::Duration;

            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "fd-count", "cat | cat | cat\n");
            let mut child = Command::new(&bin)
                .current_dir(dir.path())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()
                .unwrap();

            // push one line through the whole chain; once it comes back out,
            // every stage has been forked and the parent has no work left
            // before its wait loop
            let mut stdin = child.stdin.take().unwrap();
            stdin.write_all(b"ping\n").unwrap();
            stdin.flush().unwrap();
            let mut reader = BufReader::new(child.stdout.take().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "ping\n");

            // only stdin/stdout/stderr may remain open in the parent; allow
            // a brief settle for the closes between the last fork and wait4
            let open_fds =
                |pid: u32| fs::read_dir(format!("/proc/{pid}/fd")).unwrap().count();
            let mut fds = open_fds(child.id());
            for _ in 0..100 {
                if fds == 3 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
                fds = open_fds(child.id());
            }
            assert_eq!(fds, 3, "parent still holds pipe descriptors");

            drop(stdin);
            drop(reader);
            assert!(child.wait().unwrap().success());
        }

        #[test]
        fn pipeline_stage_redirection_wins_over_the_pipe() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "redir-pipe", "echo abc | tr a-z A-Z > up.txt\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"");
            assert_eq!(fs::read(dir.path().join("up.txt")).unwrap(), b"ABC\n");
        }

        #[test]
        fn cd_changes_the_working_directory() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "chdir", "cd /tmp; /bin/pwd\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"/tmp\n");
        }

        #[test]
        fn exit_stops_the_script() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "early", "echo a; exit; echo b\n");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"a\n");
            assert_eq!(out.status.code(), Some(0));
        }

        #[test]
        fn exec_failure_reports_and_continues() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(
                dir.path(),
                "missing",
                "no-such-command-sh2elf; echo still here\n",
            );
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"exec failed\nstill here\n");
            assert_eq!(out.status.code(), Some(0));
        }

        #[test]
        fn empty_script_just_exits_zero() {
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "empty", "");
            let out = run_in(dir.path(), &bin);
            assert_eq!(out.stdout, b"");
            assert_eq!(out.status.code(), Some(0));
        }

        #[test]
        fn output_file_is_executable_mode_0755() {
            use std::os::unix::fs::PermissionsExt;
            let dir = tempfile::tempdir().unwrap();
            let bin = compile_to(dir.path(), "mode", "echo x\n");
            let mode = fs::metadata(&bin).unwrap().permissions().mode();
            assert_eq!(mode & 0o7777, 0o755);
        }
    }
}
