use std::panic::{PanicHookInfo, take_hook};
use std::thread;

/// Install a process-wide panic hook that reports panics through `tracing`,
/// then defers to the previous hook.
///
/// Task panics inside worker pools are also caught and turned into task
/// failures; this hook only makes sure the details reach the log file.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracing::error!(
                target: "gen_scheduler::panic",
                thread = %thread_name(),
                location = %panic_location(panic_info),
                payload = %panic_payload(panic_info),
                "Panic"
            );
        }));

        previous_hook(panic_info);
    }));
}

fn thread_name() -> String {
    thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn panic_location(panic_info: &PanicHookInfo<'_>) -> String {
    panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn panic_payload(panic_info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        return s.clone();
    }
    panic_info.to_string()
}
