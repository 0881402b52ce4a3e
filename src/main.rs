use std::process;

fn main() {
    if let Err(err) = release_sync::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
