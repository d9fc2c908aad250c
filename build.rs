fn main() {
    // Dump threshold in bytes of alloc+free churn. Overridable at build time:
    //   PMEM_CHURN_THRESH=4096 cargo build --release
    let thresh = std::env::var("PMEM_CHURN_THRESH").unwrap_or_else(|_| String::from("1048576"));

    if thresh.is_empty() || !thresh.bytes().all(|b| b.is_ascii_digit()) {
        panic!("PMEM_CHURN_THRESH must be a decimal byte count, got {thresh:?}");
    }

    println!("cargo:rustc-env=PMEM_CHURN_THRESH={thresh}");
    println!("cargo:rerun-if-env-changed=PMEM_CHURN_THRESH");
}
