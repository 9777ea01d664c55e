//! ログ出力の初期化

use tracing_subscriber::{fmt, EnvFilter};

/// tracingのサブスクライバを初期化する
///
/// `RUST_LOG` が設定されていればそちらを優先します。
/// wgpu系のログは冗長なので既定では抑制します。
pub fn init_logging(verbose: u8) {
    let filter_str = match verbose {
        0 => "info,wgpu_core=warn,wgpu_hal=warn,naga=warn",
        1 => "debug,wgpu_core=warn,wgpu_hal=warn,naga=warn",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    // テストなどで二重に初期化された場合は無視する
    let _ = fmt().with_env_filter(filter).try_init();
}
