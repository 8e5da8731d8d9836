//! Build script for tether-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (let-else and `Option::is_some_and` need 1.70)

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    let Ok(found) = rustc_version::version() else {
        // Some build environments hide rustc; don't fail the build over it.
        println!("cargo:warning=could not verify Rust version");
        return;
    };

    let minimum = rustc_version::Version::new(1, 70, 0);
    if found < minimum {
        panic!("tether-core requires Rust {minimum} or newer, found {found}");
    }
}
