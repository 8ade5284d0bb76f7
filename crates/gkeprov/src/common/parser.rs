use std::fmt::{Debug, Formatter};

use nom::combinator::all_consuming;
use nom::error::{ErrorKind, ParseError};
use nom::{IResult, Parser};

/// Position and kind of the first failed combinator.
pub struct ParserError<I> {
    input: I,
    kind: ErrorKind,
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Parser error at '{:?}': expecting {:?}",
            self.input, self.kind
        ))
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError { input, kind }
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Runs `parser` and fails unless it consumes the whole `input`.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: Parser<&'a str, O, ParserError<&'a str>>,
{
    all_consuming(parser)(input)
        .map(|(_, output)| output)
        .map_err(format_parse_error)
}

#[cfg(test)]
mod tests {
    use super::{NomResult, consume_all};
    use nom::bytes::complete::tag;

    fn p_grp(input: &str) -> NomResult<&str> {
        tag("grp")(input)
    }

    #[test]
    fn test_consume_all() {
        assert_eq!(consume_all(p_grp, "grp").unwrap(), "grp");
    }

    #[test]
    fn test_consume_all_trailing_input() {
        let error = consume_all(p_grp, "grp-").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Parser error at '\"-\"': expecting Eof"
        );
    }
}
