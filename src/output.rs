use owo_colors::OwoColorize;

/// User-facing messages on stderr, colored only when stderr is a TTY.
/// Stdout is reserved for the status line and reports, printed via `print_user`.
fn is_tty() -> bool {
    atty::is(atty::Stream::Stderr)
}

pub fn print_info(msg: &str) {
    if is_tty() {
        eprintln!("{} {}", "info:".cyan().bold(), msg);
    } else {
        eprintln!("info: {}", msg);
    }
}

pub fn print_warn(msg: &str) {
    if is_tty() {
        eprintln!("{} {}", "warn:".yellow().bold(), msg);
    } else {
        eprintln!("warn: {}", msg);
    }
}

pub fn print_error(msg: &str) {
    if is_tty() {
        eprintln!("{} {}", "error:".red().bold(), msg);
    } else {
        eprintln!("error: {}", msg);
    }
}

pub fn print_success(msg: &str) {
    if is_tty() {
        eprintln!("{} {}", "ok:".green().bold(), msg);
    } else {
        eprintln!("ok: {}", msg);
    }
}

/// Plain line on stdout (no prefix, no color). Scripts parse these.
pub fn print_user(msg: &str) {
    println!("{}", msg);
}
