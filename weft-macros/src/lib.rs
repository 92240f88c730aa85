#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

//! Attribute macros for the weft runtime.

mod entry;

use proc_macro::TokenStream;

/// Marks an async function as the program entry point, run to completion on
/// a fresh weft runtime.
///
/// ```ignore
/// #[weft::main]
/// async fn main() {
///     println!("hello");
/// }
/// ```
///
/// Expands to the equivalent of:
///
/// ```ignore
/// fn main() {
///     weft::runtime::Builder::new()
///         .try_build()
///         .expect("failed building the Runtime")
///         .block_on(async {
///             println!("hello");
///         })
/// }
/// ```
///
/// The runtime is single-threaded by contract, so the macro takes no
/// configuration; use `weft::runtime::Builder` directly for custom knobs.
#[proc_macro_attribute]
pub fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    entry::expand(args.into(), item.into(), false).into()
}

/// Marks an async function as a test run on its own weft runtime.
///
/// ```ignore
/// #[weft::test]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    entry::expand(args.into(), item.into(), true).into()
}
