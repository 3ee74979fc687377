fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/ffi");

    #[cfg(feature = "generate-header")]
    header::generate();
}

/// Writes `include/tunnel.h` for hosts linking the static or dynamic library.
#[cfg(feature = "generate-header")]
mod header {
    use std::path::PathBuf;

    pub fn generate() {
        let Some(manifest_dir) = std::env::var_os("CARGO_MANIFEST_DIR") else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset; tunnel.h not generated");
            return;
        };
        let crate_dir = PathBuf::from(manifest_dir);
        let include_dir = crate_dir.join("include");
        if let Err(error) = std::fs::create_dir_all(&include_dir) {
            println!("cargo:warning=cannot create {}: {error}", include_dir.display());
            return;
        }
        match cbindgen::generate(&crate_dir) {
            Ok(bindings) => {
                bindings.write_to_file(include_dir.join("tunnel.h"));
            }
            Err(error) => println!("cargo:warning=cbindgen failed: {error}"),
        }
    }
}
