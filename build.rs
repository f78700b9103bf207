fn main() -> Result<(), Box<dyn std::error::Error>> {
    let commit_info = std::process::Command::new("git")
        .args(["show", "-s", "--format=%h %ci"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| output.stdout)
        .unwrap_or_else(|| b"unknown".to_vec());
    println!(
        "cargo:rustc-env=COMMIT_INFO={}",
        std::str::from_utf8(&commit_info)?.trim()
    );
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
