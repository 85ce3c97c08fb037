use std::{
    collections::HashMap,
    sync::atomic::Ordering,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;

use crate::state::AppState;
use crate::usage::ScopeId;

/// Run the live terminal dashboard.
/// - Tick interval: MRELAY_TUI_INTERVAL_MS (default 2000 ms).
/// - ASCII status labels to avoid column drift.
pub async fn run_terminal_dashboard(app: Arc<AppState>) {
    // Per-provider rolling counters to compute RPS
    let mut last_counts: HashMap<String, (u64, Instant)> = HashMap::new();
    let mut last_total: (u64, Instant) = (0, Instant::now());

    let interval = std::env::var("MRELAY_TUI_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2000);

    loop {
        let start = Instant::now();

        let snapshot = app.registry.snapshot();
        let mut ids: Vec<&String> = snapshot.providers.keys().collect();
        ids.sort();

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let usage = app.counters.snapshot(&ScopeId::provider(id));
            let view = app.health.view(id);

            let now = Instant::now();
            let day_requests = usage.day.requests;
            let rps = match last_counts.get(id.as_str()) {
                Some((last, last_t)) => {
                    let dt = now.duration_since(*last_t).as_secs_f64().max(0.001);
                    day_requests.saturating_sub(*last) as f64 / dt
                }
                None => 0.0,
            };
            last_counts.insert(id.clone(), (day_requests, now));

            let (status, cooldown) = match &view {
                Some(v) => {
                    let cd = v
                        .cooldown_remaining_s
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "-".to_string());
                    (v.state.as_str().to_uppercase(), cd)
                }
                None => ("?".to_string(), "-".to_string()),
            };

            rows.push(Row {
                id: truncate(id, 20),
                status,
                cooldown,
                req_minute: usage.minute.requests,
                tok_in_minute: usage.minute.input_tokens,
                tok_out_minute: usage.minute.output_tokens,
                err_day: usage.day.errors,
                rps,
                req_day: day_requests,
                last_err: view
                    .and_then(|v| v.last_error)
                    .map(|e| truncate(&e, 24))
                    .unwrap_or_else(|| "-".to_string()),
            });
        }

        let total = app.total_requests.load(Ordering::Relaxed);
        let now = Instant::now();
        let ingress_rps = {
            let dt = now.duration_since(last_total.1).as_secs_f64().max(0.001);
            let dc = total.saturating_sub(last_total.0) as f64;
            last_total = (total, now);
            dc / dt
        };

        print_frame(rows, total, ingress_rps, snapshot.version);

        let elapsed = start.elapsed();
        if elapsed < Duration::from_millis(interval) {
            sleep(Duration::from_millis(interval) - elapsed).await;
        }
    }
}

struct Row {
    id: String,
    status: String,
    cooldown: String,
    req_minute: u64,
    tok_in_minute: u64,
    tok_out_minute: u64,
    err_day: u64,
    rps: f64,
    req_day: u64,
    last_err: String,
}

// --- formatting helpers ---

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out = String::with_capacity(width);
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= width {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

fn pad(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        s.to_string()
    } else {
        format!("{}{}", s, " ".repeat(width - len))
    }
}

fn make_summary_line(total_width: usize, content: &str) -> String {
    let inner = total_width.saturating_sub(2);
    let clipped = {
        let mut out = String::new();
        for ch in content.chars() {
            if out.chars().count() >= inner {
                break;
            }
            out.push(ch);
        }
        out
    };
    format!("│{}│", pad(&clipped, inner))
}

fn print_frame(rows: Vec<Row>, total: u64, ingress_rps: f64, config_version: u64) {
    let w_id = 20usize;
    let w_stat = 10usize;
    let w_cd = 9usize;
    let w_rpm = 8usize;
    let w_tin = 11usize;
    let w_tout = 11usize;
    let w_err = 8usize;
    let w_rps = 8usize;
    let w_rpd = 10usize;
    let w_lerr = 24usize;

    let total_w = 1 + w_id + 1 + w_stat + 1 + w_cd + 1 + w_rpm + 1 + w_tin + 1 + w_tout + 1
        + w_err + 1 + w_rps + 1 + w_rpd + 1 + w_lerr + 1;

    println!("╭{}╮", "─".repeat(total_w.saturating_sub(2)));
    let line = format!(
        "  Total requests: {} | Ingress: {:.1} RPS | Config v{}",
        total, ingress_rps, config_version
    );
    println!("{}", make_summary_line(total_w, &line));
    println!("╰{}╯", "─".repeat(total_w.saturating_sub(2)));

    println!(
        "┏{}┳{}┳{}┳{}┳{}┳{}┳{}┳{}┳{}┳{}┓",
        pad(" Provider", w_id),
        pad(" Status", w_stat),
        pad(" Cool", w_cd),
        pad(" Req/m", w_rpm),
        pad(" TokIn/m", w_tin),
        pad(" TokOut/m", w_tout),
        pad(" Err/d", w_err),
        pad(" RPS", w_rps),
        pad(" Req/d", w_rpd),
        pad(" Last_err", w_lerr),
    );

    println!(
        "┡{}┿{}┿{}┿{}┿{}┿{}┿{}┿{}┿{}┿{}┩",
        "━".repeat(w_id),
        "━".repeat(w_stat),
        "━".repeat(w_cd),
        "━".repeat(w_rpm),
        "━".repeat(w_tin),
        "━".repeat(w_tout),
        "━".repeat(w_err),
        "━".repeat(w_rps),
        "━".repeat(w_rpd),
        "━".repeat(w_lerr),
    );

    for r in rows {
        println!(
            "│{}│{}│{}│{}│{}│{}│{}│{}│{}│{}│",
            pad(&r.id, w_id),
            pad(&r.status, w_stat),
            pad(&r.cooldown, w_cd),
            pad(&format!("{}", r.req_minute), w_rpm),
            pad(&format!("{}", r.tok_in_minute), w_tin),
            pad(&format!("{}", r.tok_out_minute), w_tout),
            pad(&format!("{}", r.err_day), w_err),
            pad(&format!("{:.1}", r.rps), w_rps),
            pad(&format!("{}", r.req_day), w_rpd),
            pad(&r.last_err, w_lerr),
        );
    }

    println!("└{}┘", "─".repeat(total_w.saturating_sub(2)));
}
