use std::io;

use console::style;

/// Errors go to stderr so they never mix with a listing on stdout.
pub fn print_error(message: &str) {
    eprintln!("{} {}", style("error:").red().bold(), style(message).red());
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("warning:").yellow().bold(), message);
}

/// Whether `err` comes from writing to a pipe whose reader has gone away.
pub fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::BrokenPipe)
    })
}
