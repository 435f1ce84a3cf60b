//! Regenerates the gRPC types when the `codegen` feature is enabled.
//!
//! Normal builds use the checked-in `src/gen/orderbook.rs` and need no
//! protoc. After editing `proto/orderbook.proto`:
//!
//! ```bash
//! cargo build --features codegen
//! cp target/*/build/orderbook-aggregator-*/out/orderbook.rs src/gen/
//! ```

fn main() {
    println!("cargo:rerun-if-changed=proto/orderbook.proto");
    #[cfg(feature = "codegen")]
    tonic_build::compile_protos("proto/orderbook.proto").expect("failed to compile protos");
}
