use hubgate::{logger, server};

#[tokio::main]
async fn main() {
    // Log panics before the process dies; backtraces stay behind
    // RUST_BACKTRACE as usual.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("PANIC: {message} at {location}"));
        eprintln!("FATAL PANIC: {message} at {location}");
    }));

    logger::init();
    logger::info("app", "hubgate starting");
    server::serve().await;
}
