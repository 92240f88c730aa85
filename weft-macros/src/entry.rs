use proc_macro2::TokenStream;
use quote::quote;
use syn::ItemFn;

pub(crate) fn expand(args: TokenStream, item: TokenStream, is_test: bool) -> TokenStream {
    // On any parse failure, emit the item as close to unchanged as possible
    // alongside the error so IDE features keep working.
    let mut input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(err) => return token_stream_with_error(item, err),
    };

    if !args.is_empty() {
        let msg = "this attribute takes no arguments; configure the runtime \
                   with `weft::runtime::Builder` instead";
        let err = syn::Error::new(proc_macro2::Span::call_site(), msg);
        return token_stream_with_error(quote! { #input }, err);
    }

    if input.sig.asyncness.take().is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        let err = syn::Error::new_spanned(input.sig.fn_token, msg);
        return token_stream_with_error(quote! { #input }, err);
    }

    let body = &input.block;
    let brace = input.block.brace_token;
    let mut wrapped: syn::Block = syn::parse2(quote! {
        {
            let body = async #body;
            weft::runtime::Builder::new()
                .try_build()
                .expect("failed building the Runtime")
                .block_on(body)
        }
    })
    .expect("generated block parses");
    wrapped.brace_token = brace;
    input.block = Box::new(wrapped);

    let test_attr = if is_test {
        quote! { #[::core::prelude::v1::test] }
    } else {
        quote! {}
    };

    quote! {
        #test_attr
        #input
    }
}

fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
