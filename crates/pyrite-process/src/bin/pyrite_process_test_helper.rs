//! Stand-in debuggee used by the launcher tests.

use std::{
    env,
    io::{self, Write},
    process, thread,
    time::Duration,
};

fn value(value: Option<String>, flag: &str) -> String {
    value.unwrap_or_else(|| {
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

fn write_repeated(mut writer: impl Write, mut bytes: usize, fill: u8) -> io::Result<()> {
    let buf = [fill; 8 * 1024];
    while bytes > 0 {
        let n = bytes.min(buf.len());
        writer.write_all(&buf[..n])?;
        bytes -= n;
    }
    writer.flush()
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });

    let _child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
}

fn main() {
    let mut exit_code = 0;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stdout-bytes" => {
                let bytes = parse_num(args.next(), "--stdout-bytes");
                write_repeated(io::stdout().lock(), bytes, b'a').unwrap();
            }
            "--stderr-bytes" => {
                let bytes = parse_num(args.next(), "--stderr-bytes");
                write_repeated(io::stderr().lock(), bytes, b'b').unwrap();
            }
            "--stdout" => {
                let text = value(args.next(), "--stdout");
                let mut out = io::stdout().lock();
                writeln!(out, "{text}").unwrap();
                out.flush().unwrap();
            }
            "--stderr" => {
                let text = value(args.next(), "--stderr");
                let mut err = io::stderr().lock();
                writeln!(err, "{text}").unwrap();
                err.flush().unwrap();
            }
            "--print-env" => {
                let name = value(args.next(), "--print-env");
                let var = env::var(&name).unwrap_or_default();
                println!("{name}={var}");
            }
            "--print-cwd" => {
                let cwd = env::current_dir().unwrap();
                println!("{}", cwd.display());
            }
            "--sleep-ms" => {
                let ms = parse_num(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms = parse_num(args.next(), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            "--exit-code" => {
                exit_code = parse_num(args.next(), "--exit-code");
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
    process::exit(exit_code);
}
