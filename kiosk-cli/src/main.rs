//! Kiosk CLI
//!
//! Signal server, evaluation worker and measurement orchestration.

fn main() -> anyhow::Result<()> {
    kiosk_cli::run()
}
