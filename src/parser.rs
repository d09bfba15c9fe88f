// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing-related utilities shared by the header text-block parsers.

use core::{
    cmp::Ordering,
    fmt::{Debug, Display, Formatter},
    ops::Range,
};
use std::string::String;

use nom::{
    Finish as _, Parser,
    bytes::complete::is_a,
    character::complete::multispace0,
    combinator::all_consuming,
    error::{ContextError, ErrorKind, FromExternalError, ParseError},
    sequence::delimited,
};

/// Build a typed error out of a raw nom error and the input it happened on.
pub trait FromParseError<I, E>: Sized {
    fn from_parse_error(input: I, err: &E) -> Self;
}

impl<E, I> FromParseError<I, E> for () {
    fn from_parse_error(_input: I, _err: &E) -> Self {}
}

/// Parse error keeping the backtrace of [nom_language::error::VerboseErrorKind]
/// along with the source location of each level.
#[derive(Clone, PartialEq)]
pub struct VerboseParseError {
    input: String,
    errors: Vec<(Range<usize>, nom_language::error::VerboseErrorKind)>,
}

impl Eq for VerboseParseError {}

impl VerboseParseError {
    pub fn from_input<I: AsRef<[u8]>>(input: I) -> Self {
        VerboseParseError {
            input: String::from_utf8_lossy(input.as_ref()).into_owned(),
            errors: vec![],
        }
    }

    pub fn new<I: AsRef<[u8]>, I2: AsRef<[u8]>>(
        input: I,
        err: &nom_language::error::VerboseError<I2>,
    ) -> Self {
        match core::str::from_utf8(input.as_ref()) {
            Err(err) => VerboseParseError {
                input: format!("<utf-8 decoding error: {err}>"),
                errors: vec![],
            },
            Ok(input) => {
                let errors = err
                    .errors
                    .iter()
                    .map(|(s, k)| {
                        let s = s.as_ref();
                        let offset = s.as_ptr() as usize - input.as_ptr() as usize;
                        (offset..(offset + s.len()), k.clone())
                    })
                    .collect();

                VerboseParseError {
                    input: input.into(),
                    errors,
                }
            }
        }
    }
}

impl PartialOrd<Self> for VerboseParseError {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VerboseParseError {
    #[inline]
    fn cmp<'a>(&'a self, other: &'a Self) -> Ordering {
        let key = |x: &'a Self| -> (&'a _, _) {
            (
                &x.input,
                x.errors
                    .iter()
                    // VerboseErrorKind does not implement Ord
                    .map(|(range, kind)| (range.start, range.end, format!("{kind:?}")))
                    .collect::<Vec<_>>(),
            )
        };
        key(self).cmp(&key(other))
    }
}

impl Debug for VerboseParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "VerboseParseError {{{self}}}")
    }
}

/// Display the parse error with its "context backtrace".
impl Display for VerboseParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        let input = self.input.as_str();
        let mut seen_context = false;
        let inner = nom_language::error::VerboseError {
            errors: self
                .errors
                .iter()
                // Preserve the leaf-most levels that don't have a context.
                // After the first context is encountered, display only levels
                // with a context, which makes the path easier to follow.
                .filter(|(_, kind)| match kind {
                    nom_language::error::VerboseErrorKind::Context(..) => {
                        seen_context = true;
                        true
                    }
                    _ => !seen_context,
                })
                .map(|(range, k)| (&input[range.clone()], k.clone()))
                .collect(),
        };
        write!(
            f,
            "Error while parsing:\n{}\n{}\n",
            input,
            &nom_language::error::convert_error(input, inner)
        )
    }
}

/// Tie together a nom error and some user-defined data.
#[derive(Debug)]
pub struct NomError<T, E> {
    /// User-defined data.
    pub data: Option<T>,
    /// nom error, such as [nom::error::Error]
    pub inner: E,
}

impl<T, E> NomError<T, E> {
    #[inline]
    fn from_inner(inner: E) -> Self {
        NomError { data: None, inner }
    }
}

impl<I, T, E> ParseError<I> for NomError<T, E>
where
    I: Clone,
    E: ParseError<I>,
    T: FromParseError<I, E>,
{
    #[inline]
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        NomError::from_inner(E::from_error_kind(input, kind))
    }

    #[inline]
    fn from_char(input: I, c: char) -> Self {
        NomError::from_inner(E::from_char(input, c))
    }

    #[inline]
    fn append(input: I, kind: ErrorKind, other: Self) -> Self {
        NomError {
            inner: E::append(input.clone(), kind, other.inner),
            data: other.data,
        }
    }

    #[inline]
    fn or(self, other: Self) -> Self {
        NomError {
            data: other.data,
            inner: self.inner.or(other.inner),
        }
    }
}

impl<I, T, E> FromExternalError<I, T> for NomError<T, E>
where
    E: ParseError<I>,
{
    #[inline]
    fn from_external_error(input: I, kind: ErrorKind, e: T) -> Self {
        NomError {
            data: Some(e),
            inner: E::from_error_kind(input, kind),
        }
    }
}

impl<I, T, E> ContextError<I> for NomError<T, E>
where
    E: ContextError<I>,
{
    #[inline]
    fn add_context(input: I, ctx: &'static str, other: Self) -> Self {
        NomError {
            data: other.data,
            inner: E::add_context(input, ctx, other.inner),
        }
    }
}

//////////////
// Conversions
//////////////

pub fn to_str(s: &[u8]) -> String {
    String::from_utf8_lossy(s).to_string()
}

//////////////////////
// Parsers
//////////////////////

/// Parse an ASCII hexadecimal unsigned integer in the input.
///
/// This does not parse any leading `0x` prefix, the caller is responsible for
/// that.
pub fn hex_u64<I, E>(input: I) -> nom::IResult<I, u64, E>
where
    E: ParseError<I>,
    I: Clone,
    I: nom::AsBytes + nom::Input<Item = u8>,
{
    is_a(&b"0123456789abcdefABCDEF"[..])
        .map(|x: I| {
            x.as_bytes()
                .iter()
                .rev()
                .enumerate()
                .map(|(k, v)| -> u64 {
                    let v: char = (*v).into();
                    let v: u64 = v.to_digit(16).unwrap_or(0).into();
                    v << (k * 4)
                })
                .sum()
        })
        .parse(input)
}

//////////////////////
// Generic combinators
//////////////////////

/// Extend [nom::Parser] with some methods.
pub trait NomParserExt<I, O, E, NE>: nom::Parser<I, Output = O, Error = NomError<E, NE>> {
    /// Parse the input and return a simple [Result].
    ///
    /// The parser is expected to consume all input, otherwise an error will be
    /// returned.
    #[inline]
    fn parse_finish(&mut self, input: I) -> Result<O, E>
    where
        I: nom::Input + Clone + Debug,
        NE: Debug + ParseError<I>,
        E: Debug + FromParseError<I, NE>,
    {
        let mut parser = all_consuming(|input| self.parse(input));
        match parser.parse(input.clone()).finish() {
            Err(err) => match err.data {
                None => Err(E::from_parse_error(input, &err.inner)),
                Some(err) => Err(err),
            },
            Ok((_, x)) => Ok(x),
        }
    }
}

impl<I, O, E, NE, P> NomParserExt<I, O, E, NE> for P where
    P: nom::Parser<I, Output = O, Error = NomError<E, NE>>
{
}

/// Wraps a [nom::Parser] to parse optional whitespaces before and after.
pub fn lexeme<I, O, E, P>(inner: P) -> impl nom::Parser<I, Output = O, Error = E>
where
    E: ParseError<I>,
    P: nom::Parser<I, Output = O, Error = E>,
    I: Clone + nom::Input,
    <I as nom::Input>::Item: Clone + nom::AsChar,
{
    delimited(multispace0, inner, multispace0)
}

/// Similar to [nom::combinator::map_res] but does not backtrack in case `f`
/// returns an error.
///
/// This allows correct error handling for all cases where the grammar is
/// non-ambiguous and `f` is doing semantic checking. In such situation, a
/// semantic error is not expected to trigger a backtrack in the parser,
/// leading to much worse error messages.
pub fn map_res_cut<I: Clone, O1, O2, E: FromExternalError<I, E2>, E2, F, G>(
    mut parser: F,
    mut f: G,
) -> impl nom::Parser<I, Output = O2, Error = E>
where
    F: Parser<I, Output = O1, Error = E>,
    G: FnMut(O1) -> Result<O2, E2>,
    E: ParseError<I>,
{
    move |input: I| {
        let i = input.clone();
        let (input, x) = parser.parse(input)?;
        match f(x) {
            Ok(x) => Ok((input, x)),
            Err(err) => Err(nom::Err::Failure(E::from_external_error(
                i,
                ErrorKind::MapRes,
                err,
            ))),
        }
    }
}

/// Craft a [nom::IResult] error from the given error and input.
#[inline]
pub fn error<I, O, E, E2>(input: I, err: E) -> nom::IResult<I, O, E2>
where
    E2: FromExternalError<I, E>,
{
    Err(nom::Err::Error(E2::from_external_error(
        input,
        ErrorKind::Fail,
        err,
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use nom::Finish as _;
    use nom_language::error::{VerboseError, convert_error};

    use super::*;

    pub trait DisplayErr {
        fn display_err(&self) -> String;
    }
    pub trait DisplayErrViaDisplay {}

    impl DisplayErrViaDisplay for crate::header::HeaderError {}

    impl<T> DisplayErr for T
    where
        T: DisplayErrViaDisplay + Display,
    {
        fn display_err(&self) -> String {
            format!("{}", self)
        }
    }

    impl DisplayErr for () {
        fn display_err(&self) -> String {
            "".into()
        }
    }

    // This function _must_ preserve the address of buf, as
    // nom_language::error::convert_error() relies on the VerboseError input
    // stack to be pointers into the overall input.
    pub fn zero_copy_to_str(buf: &[u8]) -> &str {
        std::str::from_utf8(buf).unwrap()
    }

    pub fn run_parser<I, O, T, P>(input: I, parser: P) -> O
    where
        O: Debug + PartialEq,
        P: Parser<I, Output = O, Error = NomError<T, VerboseError<I>>>,
        I: nom::AsBytes + nom::Input + Clone,
        T: DisplayErr + FromParseError<I, nom_language::error::VerboseError<I>>,
    {
        let mut parser = all_consuming(parser);
        let parsed = parser.parse(input.clone()).finish();
        let input = zero_copy_to_str(input.as_bytes());
        match parsed {
            Ok((_, parsed)) => parsed,
            Err(err) => {
                let mut seen_context = false;
                let inner = VerboseError {
                    errors: err
                        .inner
                        .errors
                        .iter()
                        .filter(|(_, kind)| match kind {
                            nom_language::error::VerboseErrorKind::Context(..) => {
                                seen_context = true;
                                true
                            }
                            _ => !seen_context,
                        })
                        .map(|(s, err)| (zero_copy_to_str(s.as_bytes()), err.clone()))
                        .collect(),
                };
                let loc = convert_error(input, inner);
                let err_data = match err.data {
                    Some(data) => data.display_err(),
                    None => "<unknown parse error>".into(),
                };
                panic!("Could not parse {input:?}: {err_data} :\n{loc}")
            }
        }
    }

    pub fn test_parser<I, O, T, P>(expected: O, input: I, parser: P)
    where
        O: Debug + PartialEq,
        T: DisplayErr + FromParseError<I, nom_language::error::VerboseError<I>>,
        P: Parser<I, Output = O, Error = NomError<T, VerboseError<I>>>,
        I: nom::AsBytes + nom::Input + Clone,
    {
        let parsed = run_parser(input.clone(), parser);

        let input = zero_copy_to_str(input.as_bytes());
        assert_eq!(parsed, expected, "while parsing: {input:?}");
    }
}
