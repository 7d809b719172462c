fn main() {
    println!("cargo:rerun-if-env-changed=SWIFTLS_VERSION");
    if let Ok(version) = std::env::var("SWIFTLS_VERSION") {
        println!("cargo:rustc-env=CARGO_PKG_VERSION={version}");
    }
}
