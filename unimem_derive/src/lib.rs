extern crate proc_macro;

use proc_macro2::{Ident, Span, TokenStream};
use quote::quote;
use syn::{
    parse_macro_input, parse_quote, Data, DataStruct, DataUnion, DeriveInput, Field,
    Fields, Generics,
};

use proc_macro::TokenStream as BaseTokenStream;

/// Implements `unimem::memory::DeviceCopy` for a type, after checking at compile time that every
/// field is itself `DeviceCopy`.
#[proc_macro_derive(DeviceCopy)]
pub fn derive_device_copy(input: BaseTokenStream) -> BaseTokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    BaseTokenStream::from(impl_device_copy(&ast))
}

fn impl_device_copy(input: &DeriveInput) -> TokenStream {
    let input_type = &input.ident;

    // Generate the code to check all fields of the derived type
    let check_types_code = match input.data {
        Data::Struct(ref data_struct) => type_check_struct(data_struct),
        Data::Union(ref data_union) => type_check_union(data_union),
        // The all-zero bit pattern of an enum is not guaranteed to be a valid value.
        Data::Enum(_) => {
            return syn::Error::new_spanned(
                input_type,
                "DeviceCopy cannot be derived for enums; implement it manually",
            )
            .to_compile_error()
        }
    };

    let type_test_func_name = format!("__verify_{}_can_implement_DeviceCopy", input_type);
    let type_test_func_ident = Ident::new(&type_test_func_name, Span::call_site());

    let generics = add_bound_to_generics(&input.generics);
    let (impl_generics, type_generics, where_clause) = generics.split_for_impl();

    quote! {
        unsafe impl #impl_generics ::unimem::memory::DeviceCopy
            for #input_type #type_generics #where_clause {}

        #[doc(hidden)]
        #[allow(non_snake_case, dead_code, unused_variables)]
        fn #type_test_func_ident #impl_generics(value: &#input_type #type_generics) #where_clause {
            #check_types_code
        }
    }
}

fn add_bound_to_generics(generics: &Generics) -> Generics {
    let mut new_generics = generics.clone();
    for type_param in new_generics.type_params_mut() {
        type_param
            .bounds
            .push(parse_quote!(::unimem::memory::DeviceCopy));
    }
    new_generics
}

fn type_check_struct(s: &DataStruct) -> TokenStream {
    let checks = match s.fields {
        Fields::Named(ref named_fields) => {
            let fields: Vec<&Field> = named_fields.named.iter().collect();
            check_fields(&fields)
        }
        Fields::Unnamed(ref unnamed_fields) => {
            let fields: Vec<&Field> = unnamed_fields.unnamed.iter().collect();
            check_fields(&fields)
        }
        Fields::Unit => vec![],
    };
    quote!(
        #(#checks)*
    )
}

fn type_check_union(s: &DataUnion) -> TokenStream {
    let fields: Vec<&Field> = s.fields.named.iter().collect();
    let checks = check_fields(&fields);
    quote!(
        #(#checks)*
    )
}

fn check_fields(fields: &[&Field]) -> Vec<TokenStream> {
    fields
        .iter()
        .map(|field| {
            let field_type = &field.ty;
            quote! {
                {
                    fn assert_impl<T: ::unimem::memory::DeviceCopy + ?Sized>() {}
                    assert_impl::<#field_type>();
                }
            }
        })
        .collect()
}
