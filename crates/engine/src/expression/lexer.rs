use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    In,
    Dot,
    Comma,
    Colon,
    Question,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let characters: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut cursor = 0;

    while cursor < characters.len() {
        let (position, character) = characters[cursor];
        if character.is_whitespace() {
            cursor += 1;
            continue;
        }

        let peek = characters.get(cursor + 1).map(|(_, next)| *next);
        let two_char = match (character, peek) {
            ('=', Some('=')) => Some(Token::EqEq),
            ('!', Some('=')) => Some(Token::NotEq),
            ('<', Some('=')) => Some(Token::LessEq),
            ('>', Some('=')) => Some(Token::GreaterEq),
            ('&', Some('&')) => Some(Token::AndAnd),
            ('|', Some('|')) => Some(Token::OrOr),
            _ => None,
        };
        if let Some(token) = two_char {
            tokens.push(Spanned { token, position });
            cursor += 2;
            continue;
        }

        let single = match character {
            '.' if !peek.is_some_and(|next| next.is_ascii_digit()) => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            '(' => Some(Token::LeftParen),
            ')' => Some(Token::RightParen),
            '[' => Some(Token::LeftBracket),
            ']' => Some(Token::RightBracket),
            '!' => Some(Token::Bang),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '<' => Some(Token::Less),
            '>' => Some(Token::Greater),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned { token, position });
            cursor += 1;
            continue;
        }

        if character == '"' || character == '\'' {
            let (literal, next) = read_string(&characters, cursor, character)?;
            tokens.push(Spanned {
                token: Token::Str(literal),
                position,
            });
            cursor = next;
            continue;
        }

        if character.is_ascii_digit() || character == '.' {
            let (token, next) = read_number(source, &characters, cursor)?;
            tokens.push(Spanned { token, position });
            cursor = next;
            continue;
        }

        if character.is_alphabetic() || character == '_' {
            let start = cursor;
            while cursor < characters.len() && (characters[cursor].1.is_alphanumeric() || characters[cursor].1 == '_') {
                cursor += 1;
            }
            let word: String = characters[start..cursor].iter().map(|(_, c)| *c).collect();
            let token = match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "nil" | "null" => Token::Null,
                "in" => Token::In,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, position });
            continue;
        }

        return Err(ExpressionError::syntax(position, format!("unexpected character '{character}'")));
    }

    Ok(tokens)
}

fn read_string(characters: &[(usize, char)], start: usize, quote: char) -> Result<(String, usize), ExpressionError> {
    let mut literal = String::new();
    let mut cursor = start + 1;
    while cursor < characters.len() {
        let (position, character) = characters[cursor];
        match character {
            '\\' => {
                let Some((_, escaped)) = characters.get(cursor + 1) else {
                    return Err(ExpressionError::syntax(position, "dangling escape"));
                };
                literal.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                cursor += 2;
            }
            c if c == quote => return Ok((literal, cursor + 1)),
            c => {
                literal.push(c);
                cursor += 1;
            }
        }
    }
    Err(ExpressionError::syntax(characters[start].0, "unterminated string literal"))
}

fn read_number(source: &str, characters: &[(usize, char)], start: usize) -> Result<(Token, usize), ExpressionError> {
    let mut cursor = start;
    let mut is_float = false;
    while cursor < characters.len() {
        let character = characters[cursor].1;
        if character.is_ascii_digit() || character == '_' {
            cursor += 1;
        } else if character == '.' && !is_float && characters.get(cursor + 1).is_some_and(|(_, next)| next.is_ascii_digit()) {
            is_float = true;
            cursor += 1;
        } else if (character == 'e' || character == 'E')
            && characters
                .get(cursor + 1)
                .is_some_and(|(_, next)| next.is_ascii_digit() || *next == '-' || *next == '+')
        {
            is_float = true;
            cursor += 2;
        } else {
            break;
        }
    }

    let position = characters[start].0;
    let end = characters.get(cursor).map(|(offset, _)| *offset).unwrap_or(source.len());
    let text: String = source[position..end].chars().filter(|c| *c != '_').collect();
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| ExpressionError::syntax(position, format!("invalid number '{text}'")))?,
        )
    } else {
        match text.parse::<i64>() {
            Ok(value) => Token::Integer(value),
            Err(_) => Token::Float(
                text.parse()
                    .map_err(|_| ExpressionError::syntax(position, format!("invalid number '{text}'")))?,
            ),
        }
    };
    Ok((token, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).expect("tokens").into_iter().map(|spanned| spanned.token).collect()
    }

    #[test]
    fn tokenizes_paths_and_operators() {
        assert_eq!(
            kinds("steps[0].res.status >= 200 && !vars.done"),
            vec![
                Token::Ident("steps".into()),
                Token::LeftBracket,
                Token::Integer(0),
                Token::RightBracket,
                Token::Dot,
                Token::Ident("res".into()),
                Token::Dot,
                Token::Ident("status".into()),
                Token::GreaterEq,
                Token::Integer(200),
                Token::AndAnd,
                Token::Bang,
                Token::Ident("vars".into()),
                Token::Dot,
                Token::Ident("done".into()),
            ]
        );
    }

    #[test]
    fn tokenizes_literals() {
        assert_eq!(
            kinds(r#"'it\'s' "a\"b" 1.5 .5 1e3 nil"#),
            vec![
                Token::Str("it's".into()),
                Token::Str("a\"b".into()),
                Token::Float(1.5),
                Token::Float(0.5),
                Token::Float(1000.0),
                Token::Null,
            ]
        );
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert!(matches!(tokenize("\"open"), Err(ExpressionError::Syntax { position: 0, .. })));
        assert!(matches!(tokenize("a # b"), Err(ExpressionError::Syntax { position: 2, .. })));
    }
}
