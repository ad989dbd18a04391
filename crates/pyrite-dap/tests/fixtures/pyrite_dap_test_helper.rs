//! Stand-in interpreter for the adapter tests.
//!
//! Launch command lines put launcher scripts, ports and program paths in front
//! of the program arguments; anything that is not one of the flags below is
//! ignored so those pass through harmlessly.

use std::{
    env, fs,
    io::{self, Write},
    process, thread,
    time::Duration,
};

fn value(arg: Option<String>, flag: &str) -> String {
    arg.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn parse_num<T: std::str::FromStr>(arg: Option<String>, flag: &str) -> T {
    let raw = value(arg, flag);
    raw.parse().unwrap_or_else(|_| {
        eprintln!("invalid number for {flag}: {raw}");
        process::exit(2);
    })
}

fn main() {
    let mut exit_code = 0;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--pid-file" => {
                let path = value(args.next(), "--pid-file");
                fs::write(&path, process::id().to_string()).unwrap_or_else(|err| {
                    eprintln!("failed to write pid file {path}: {err}");
                    process::exit(2);
                });
            }
            "--stdout" => {
                let text = value(args.next(), "--stdout");
                let mut out = io::stdout().lock();
                let _ = writeln!(out, "{text}");
                let _ = out.flush();
            }
            "--stderr" => {
                let text = value(args.next(), "--stderr");
                let mut err = io::stderr().lock();
                let _ = writeln!(err, "{text}");
                let _ = err.flush();
            }
            "--sleep-ms" => {
                let ms: u64 = parse_num(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--flood" => {
                // Writes until the pipe breaks or the process is killed.
                let line = [b'y'; 79];
                let mut out = io::stdout().lock();
                while out.write_all(&line).and_then(|()| out.write_all(b"\n")).is_ok() {}
                process::exit(0);
            }
            "--exit-code" => {
                exit_code = parse_num(args.next(), "--exit-code");
            }
            _ => {}
        }
    }
    process::exit(exit_code);
}
