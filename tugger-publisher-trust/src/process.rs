// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    log::warn,
    std::{
        ffi::OsString,
        io::{BufRead, BufReader},
        path::Path,
    },
};

/// Outcome of an external tool invocation.
#[derive(Clone, Debug)]
pub(crate) struct ToolOutput {
    pub success: bool,
    pub lines: Vec<String>,
}

/// Run a program, forwarding its combined output to the logger.
///
/// Arguments listed in `redact` are replaced in the logged command line.
pub(crate) fn run_logged(
    program: &Path,
    args: &[OsString],
    redact: &[&str],
) -> std::io::Result<ToolOutput> {
    let rendered = args
        .iter()
        .map(|arg| {
            let arg = arg.to_string_lossy();
            if redact.iter().any(|secret| !secret.is_empty() && arg == *secret) {
                "<redacted>".to_string()
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    log::debug!("running {} {}", program.display(), rendered);

    let command = duct::cmd(program, args)
        .stderr_to_stdout()
        .unchecked()
        .reader()?;

    let mut lines = vec![];
    {
        let reader = BufReader::new(&command);
        for line in reader.lines() {
            let line = line?;
            warn!("{}", line);
            lines.push(line);
        }
    }

    let output = command.try_wait()?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "unable to wait on command")
    })?;

    Ok(ToolOutput {
        success: output.status.success(),
        lines,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_output_and_status() -> anyhow::Result<()> {
        let sh = match which::which("sh") {
            Ok(sh) => sh,
            Err(_) => {
                eprintln!("sh not available; skipping");
                return Ok(());
            }
        };

        let output = run_logged(
            &sh,
            &["-c".into(), "echo hello; echo oops >&2; exit 3".into()],
            &[],
        )?;
        assert!(!output.success);
        assert_eq!(output.lines, vec!["hello".to_string(), "oops".to_string()]);

        let output = run_logged(&sh, &["-c".into(), "true".into()], &[])?;
        assert!(output.success);

        Ok(())
    }
}
