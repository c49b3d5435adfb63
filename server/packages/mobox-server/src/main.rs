fn main() {
    if let Err(err) = mobox_server::cli::run_mobox() {
        tracing::error!(error = %err, "mobox-server failed");
        std::process::exit(1);
    }
}
