#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use pyrite_dap::dap::DapReader;
use tokio::runtime::Runtime;

mod utils;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build fuzz runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);

    // Goal: framing errors surface as `DapError`, never as a panic or a hang.
    runtime().block_on(async {
        let mut reader = DapReader::new(input);
        loop {
            match reader.read_value().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {}
                Err(_) => break,
            }
        }
    });
});
