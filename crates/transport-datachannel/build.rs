use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=DATACHANNEL_LIB_DIR");

    if env::var("CARGO_FEATURE_NATIVE").is_err() {
        // The loopback engine needs nothing from the system.
        return;
    }

    if let Ok(dir) = env::var("DATACHANNEL_LIB_DIR") {
        if !dir.trim().is_empty() {
            println!("cargo:rustc-link-search=native={dir}");
        }
    }

    println!("cargo:rustc-link-lib=dylib=datachannel");
}
