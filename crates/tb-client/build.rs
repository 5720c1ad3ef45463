//! Link search path for the engine's native library (feature `native`).

fn main() {
    println!("cargo:rerun-if-env-changed=TB_CLIENT_LIB_DIR");

    if std::env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    if let Ok(dir) = std::env::var("TB_CLIENT_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
        println!("cargo:rustc-link-arg=-Wl,-rpath,{dir}");
    }
}
