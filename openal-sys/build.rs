extern crate bindgen;
extern crate pkg_config;

use std::env;
use std::path::PathBuf;

/// Alure 1.x predates pkg-config support on most distros, so probing it can
/// fail even when the library and headers are installed. Fall back to
/// linking by name and hoping the headers are on the default search path.
fn probe_or_fallback(lib: &str) -> Vec<PathBuf> {
    match pkg_config::probe_library(lib) {
        Ok(library) => library.include_paths,
        Err(_) => {
            println!("cargo:rustc-link-lib=dylib={}", lib);
            Vec::new()
        }
    }
}

fn main() {
    let mut include_paths = probe_or_fallback("openal");
    include_paths.extend(probe_or_fallback("alure"));

    println!("cargo:rerun-if-changed=build.rs");

    let mut builder = bindgen::builder()
        .header_contents(
            "openal-sys-wrapper.h",
            "#include <AL/al.h>\n#include <AL/alc.h>\n#include <AL/alure.h>\n",
        )
        .prepend_enum_name(false)
        .whitelist_function("al[A-Z].*")
        .whitelist_function("alc[A-Z].*")
        .whitelist_function("alure[A-Z].*")
        .whitelist_var("AL_.*")
        .whitelist_var("ALC_.*")
        .whitelist_type("AL[A-Za-z]*");

    for include_path in &include_paths {
        builder = builder.clang_arg(format!("-I{}", include_path.display()));
    }

    let bindings = builder
        .generate()
        .expect("Failed to generate OpenAL/Alure bindings - is libopenal-dev/libalure-dev installed?")
        .to_string();

    let mut bindings_path = env::var_os("OUT_DIR").unwrap();
    bindings_path.push("/openal.rs");

    std::fs::write(bindings_path, bindings.as_bytes()).unwrap();
}
