//! Stamps the binary with the commit and build time shown by
//! `grocery-cart-sync --version` and logged at startup.

use std::process::Command;

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn build_timestamp() -> String {
    command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            command_output(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| "unknown".into())
}

fn main() {
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp());

    let git_sha = command_output("git", &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    println!("cargo:rerun-if-changed=.git/HEAD");
}
