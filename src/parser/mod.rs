use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at token {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

const MAX_ERRORS: usize = 20;

/// Parses a token stream into a program, collecting as many errors as
/// possible. Recovery skips to the next statement boundary and leaves a
/// `Stmt::Error` placeholder.
pub fn parse(tokens: Vec<(Token, Span)>) -> (Program, Vec<ParseError>) {
    Parser::new(tokens).parse_program()
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn matches(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, message: &str) -> Result<()> {
        if self.matches(expected) {
            Ok(())
        } else {
            Err(self.error(message.to_string()))
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(message.to_string())),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError { position: self.pos, span: self.peek_span(), message }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Types ----

    fn prim_at(&self, idx: usize) -> Option<Prim> {
        match self.peek_at(idx)? {
            Token::Int => Some(Prim::Int),
            Token::Float => Some(Prim::Float),
            Token::Double => Some(Prim::Double),
            Token::Char => Some(Prim::Char),
            Token::Bool => Some(Prim::Bool),
            Token::Void => Some(Prim::Void),
            _ => None,
        }
    }

    fn at_type_name(&self) -> bool {
        self.prim_at(self.pos).is_some()
    }

    /// `int` or `int[4]`.
    fn parse_type(&mut self) -> Result<Type> {
        let Some(elem) = self.prim_at(self.pos) else {
            return Err(self.error("expected a type name".into()));
        };
        self.pos += 1;

        if !self.matches(&Token::OpenBracket) {
            return Ok(Type::Prim(elem));
        }
        if elem == Prim::Void {
            return Err(self.error("arrays of void are not a type".into()));
        }
        let len = match self.advance() {
            Some(Token::IntLit(n)) if n > 0 => n as usize,
            _ => return Err(self.error("expected an array length".into())),
        };
        self.expect(&Token::CloseBracket, "expected ']' after array length")?;
        Ok(Type::Array { elem, len })
    }

    /// True when the tokens at `pos` shape like `type name (`.
    fn looks_like_function(&self) -> bool {
        let mut i = self.pos;
        if self.prim_at(i).is_none() {
            return false;
        }
        i += 1;
        if self.peek_at(i) == Some(&Token::OpenBracket) {
            i += 3;
        }
        matches!(self.peek_at(i), Some(Token::Ident(_)))
            && self.peek_at(i + 1) == Some(&Token::OpenParen)
    }

    // ---- Top level ----

    pub fn parse_program(&mut self) -> (Program, Vec<ParseError>) {
        let mut items = Vec::new();
        let mut errors = Vec::new();

        while !self.at_end() {
            if errors.len() >= MAX_ERRORS {
                break;
            }
            match self.parse_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    errors.push(e);
                    self.synchronize();
                    items.push(Item::Stmt(Stmt::Error));
                }
            }
        }

        (Program { items }, errors)
    }

    fn parse_item(&mut self) -> Result<Item> {
        if self.looks_like_function() {
            return self.function_declaration().map(Item::Function);
        }
        if self.at_type_name() {
            let ty = self.parse_type()?;
            let (name, init) = self.variable_declaration(ty)?;
            return Ok(Item::Global { ty, name, init });
        }
        self.statement().map(Item::Stmt)
    }

    fn function_declaration(&mut self) -> Result<Function> {
        let ret = match self.parse_type()? {
            Type::Prim(p) => p,
            ty => return Err(self.error(format!("functions cannot return {ty}"))),
        };
        let name = self.expect_ident("expected a function name")?;
        self.expect(&Token::OpenParen, "expected '(' after function name")?;

        let mut params = Vec::new();
        if !self.check(&Token::CloseParen) {
            loop {
                let ty = self.parse_type()?;
                if ty == Type::Prim(Prim::Void) {
                    return Err(self.error("parameters cannot be void".into()));
                }
                let pname = self.expect_ident("expected a parameter name")?;
                params.push((pname, ty));
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::CloseParen, "expected ')' after parameters")?;
        self.expect(&Token::OpenBrace, "expected '{' at function start")?;
        let body = self.block_body()?;
        Ok(Function { name, params, ret, body })
    }

    /// The shared tail of global and local declarations: name, optional
    /// initializer, semicolon.
    fn variable_declaration(&mut self, ty: Type) -> Result<(String, Option<Expr>)> {
        if ty == Type::Prim(Prim::Void) {
            return Err(self.error("variables cannot be void".into()));
        }
        let name = self.expect_ident("expected a variable name")?;
        let init = if self.matches(&Token::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(&Token::Semicolon, "expected ';' after variable declaration")?;
        Ok((name, init))
    }

    fn synchronize(&mut self) {
        while let Some(token) = self.peek() {
            match token {
                Token::Semicolon => {
                    self.pos += 1;
                    return;
                }
                Token::Int
                | Token::Float
                | Token::Double
                | Token::Char
                | Token::Bool
                | Token::Void
                | Token::If
                | Token::While
                | Token::For
                | Token::Return
                | Token::OpenBrace
                | Token::CloseBrace => return,
                _ => self.pos += 1,
            }
        }
    }

    // ---- Statements ----

    fn statement(&mut self) -> Result<Stmt> {
        if self.matches(&Token::OpenBrace) {
            return Ok(Stmt::Block(self.block_body()?));
        }
        if self.check(&Token::If) {
            return self.if_statement();
        }
        if self.check(&Token::While) {
            return self.while_statement();
        }
        if self.check(&Token::For) {
            return self.for_statement();
        }
        if self.matches(&Token::Return) {
            let value = if self.check(&Token::Semicolon) {
                None
            } else {
                Some(self.expression()?)
            };
            self.expect(&Token::Semicolon, "expected ';' after return statement")?;
            return Ok(Stmt::Return(value));
        }

        let expr = self.expression()?;
        self.expect(&Token::Semicolon, "expected ';' after expression statement")?;
        Ok(Stmt::Expr(expr))
    }

    /// Statements until the closing brace; declarations allowed.
    fn block_body(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.check(&Token::CloseBrace) && !self.at_end() {
            if self.at_type_name() {
                let ty = self.parse_type()?;
                let (name, init) = self.variable_declaration(ty)?;
                stmts.push(Stmt::VarDecl { ty, name, init });
            } else {
                stmts.push(self.statement()?);
            }
        }
        self.expect(&Token::CloseBrace, "expected '}' after block")?;
        Ok(stmts)
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        self.advance();
        self.expect(&Token::OpenParen, "expected '(' after 'if'")?;
        let cond = self.expression()?;
        self.expect(&Token::CloseParen, "expected ')' after if condition")?;
        let then = Box::new(self.statement()?);
        let els = if self.matches(&Token::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, els })
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        self.advance();
        self.expect(&Token::OpenParen, "expected '(' after 'while'")?;
        let cond = self.expression()?;
        self.expect(&Token::CloseParen, "expected ')' after while condition")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        self.advance();
        self.expect(&Token::OpenParen, "expected '(' after 'for'")?;

        let init = if self.matches(&Token::Semicolon) {
            None
        } else if self.at_type_name() {
            let ty = self.parse_type()?;
            let (name, init) = self.variable_declaration(ty)?;
            Some(Box::new(Stmt::VarDecl { ty, name, init }))
        } else {
            let expr = self.expression()?;
            self.expect(&Token::Semicolon, "expected ';' after first part of 'for'")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if self.matches(&Token::Semicolon) {
            None
        } else {
            let cond = self.expression()?;
            self.expect(&Token::Semicolon, "expected ';' after second part of 'for'")?;
            Some(cond)
        };

        let step = if self.check(&Token::CloseParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&Token::CloseParen, "expected ')' after 'for' clauses")?;

        let body = Box::new(self.statement()?);
        Ok(Stmt::For { init, cond, step, body })
    }

    // ---- Expressions, lowest precedence first ----

    fn expression(&mut self) -> Result<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr> {
        let expr = self.logic_or()?;

        let compound = match self.peek() {
            Some(Token::Equal) => None,
            Some(Token::PlusEqual) => Some(BinaryOp::Add),
            Some(Token::MinusEqual) => Some(BinaryOp::Sub),
            Some(Token::StarEqual) => Some(BinaryOp::Mul),
            Some(Token::SlashEqual) => Some(BinaryOp::Div),
            Some(Token::PercentEqual) => Some(BinaryOp::Mod),
            Some(Token::BitAndEqual) => Some(BinaryOp::BitAnd),
            Some(Token::BitOrEqual) => Some(BinaryOp::BitOr),
            Some(Token::BitXorEqual) => Some(BinaryOp::BitXor),
            Some(Token::ShiftLeftEqual) => Some(BinaryOp::Shl),
            Some(Token::ShiftRightEqual) => Some(BinaryOp::Shr),
            _ => return Ok(expr),
        };
        self.advance();

        if !matches!(expr, Expr::Variable(_) | Expr::Index { .. }) {
            return Err(self.error("invalid assignment target".into()));
        }

        let rhs = self.assignment()?;
        let value = match compound {
            // `x += e` is sugar for `x = x + e`.
            Some(op) => Expr::Binary {
                op,
                left: Box::new(expr.clone()),
                right: Box::new(rhs),
            },
            None => rhs,
        };
        Ok(Expr::Assign { target: Box::new(expr), value: Box::new(value) })
    }

    fn logic_or(&mut self) -> Result<Expr> {
        let mut left = self.logic_and()?;
        while self.matches(&Token::Or) {
            let right = self.logic_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logic_and(&mut self) -> Result<Expr> {
        let mut left = self.bit_or()?;
        while self.matches(&Token::And) {
            let right = self.bit_or()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        ops: &[(Token, BinaryOp)],
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.matches(token) {
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bit_or(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_xor, &[(Token::BitOr, BinaryOp::BitOr)])
    }

    fn bit_xor(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_and, &[(Token::BitXor, BinaryOp::BitXor)])
    }

    fn bit_and(&mut self) -> Result<Expr> {
        self.binary_level(Self::equality, &[(Token::BitAnd, BinaryOp::BitAnd)])
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::comparison,
            &[(Token::EqualEqual, BinaryOp::Eq), (Token::BangEqual, BinaryOp::Ne)],
        )
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::bitshift,
            &[
                (Token::Less, BinaryOp::Lt),
                (Token::LessEqual, BinaryOp::Le),
                (Token::Great, BinaryOp::Gt),
                (Token::GreatEqual, BinaryOp::Ge),
            ],
        )
    }

    fn bitshift(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::addition,
            &[(Token::ShiftLeft, BinaryOp::Shl), (Token::ShiftRight, BinaryOp::Shr)],
        )
    }

    fn addition(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::multiplication,
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        )
    }

    fn multiplication(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::prefix,
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn prefix(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Plus),
            Some(Token::PlusPlus) => Some(UnaryOp::PreInc),
            Some(Token::MinusMinus) => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.unary()?;
            return Ok(Expr::Unary { op, expr: Box::new(expr) });
        }
        self.unary()
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.matches(&Token::Bang) {
            let expr = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr) });
        }
        if self.matches(&Token::Tilde) {
            let expr = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::BitNot, expr: Box::new(expr) });
        }
        if self.at_cast() {
            self.advance();
            let to = self.prim_at(self.pos).expect("checked by at_cast");
            self.pos += 2;
            let expr = self.unary()?;
            return Ok(Expr::Cast { to, expr: Box::new(expr) });
        }
        self.call()
    }

    /// `( prim )` followed by an operand.
    fn at_cast(&self) -> bool {
        self.peek() == Some(&Token::OpenParen)
            && self.prim_at(self.pos + 1).is_some()
            && self.peek_at(self.pos + 2) == Some(&Token::CloseParen)
    }

    fn call(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.matches(&Token::OpenParen) {
                let Expr::Variable(callee) = expr else {
                    return Err(self.error("only named functions can be called".into()));
                };
                let mut args = Vec::new();
                if !self.check(&Token::CloseParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.matches(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::CloseParen, "expected ')' after arguments")?;
                expr = Expr::Call { callee, args };
            } else if self.matches(&Token::OpenBracket) {
                let index = self.expression()?;
                self.expect(&Token::CloseBracket, "expected ']' after array index")?;
                expr = Expr::Index { base: Box::new(expr), index: Box::new(index) };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::True) => Ok(Expr::BoolLit(true)),
            Some(Token::False) => Ok(Expr::BoolLit(false)),
            Some(Token::IntLit(v)) => Ok(Expr::IntLit(v)),
            Some(Token::FloatLit(v)) => Ok(Expr::FloatLit(v)),
            Some(Token::DoubleLit(v)) => Ok(Expr::DoubleLit(v)),
            Some(Token::CharLit(v)) => Ok(Expr::CharLit(v)),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::OpenParen) => {
                let expr = self.expression()?;
                self.expect(&Token::CloseParen, "expected ')' after grouping")?;
                Ok(expr)
            }
            Some(_) => {
                // Put the offending token back so recovery sees it.
                self.pos -= 1;
                Err(self.error("expected an expression".into()))
            }
            None => Err(self.error("expected an expression, got end of input".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_ok(source: &str) -> Program {
        let (program, errors) = parse(lex(source).unwrap());
        assert!(errors.is_empty(), "{errors:?}");
        program
    }

    #[test]
    fn parses_global_and_function() {
        let program = parse_ok("int x = 5; int add(int a, int b) { return a + b; }");
        assert_eq!(program.items.len(), 2);
        assert!(matches!(&program.items[0], Item::Global { name, .. } if name == "x"));
        let Item::Function(f) = &program.items[1] else {
            panic!("expected a function");
        };
        assert_eq!(f.name, "add");
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.ret, Prim::Int);
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let program = parse_ok("x = 2 + y * 3;");
        let Item::Stmt(Stmt::Expr(Expr::Assign { value, .. })) = &program.items[0] else {
            panic!("expected an assignment statement");
        };
        let Expr::Binary { op: BinaryOp::Add, right, .. } = value.as_ref() else {
            panic!("expected addition at the top");
        };
        assert!(matches!(right.as_ref(), Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn compound_assignment_desugars() {
        let program = parse_ok("x += 1;");
        let Item::Stmt(Stmt::Expr(Expr::Assign { target, value })) = &program.items[0] else {
            panic!("expected an assignment");
        };
        assert_eq!(target.as_ref(), &Expr::Variable("x".into()));
        assert!(matches!(value.as_ref(), Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn cast_versus_grouping() {
        let program = parse_ok("x = (double)y; z = (y);");
        let Item::Stmt(Stmt::Expr(Expr::Assign { value, .. })) = &program.items[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(value.as_ref(), Expr::Cast { to: Prim::Double, .. }));
        let Item::Stmt(Stmt::Expr(Expr::Assign { value, .. })) = &program.items[1] else {
            panic!("expected assignment");
        };
        assert!(matches!(value.as_ref(), Expr::Variable(_)));
    }

    #[test]
    fn array_declaration_and_indexing() {
        let program = parse_ok("int[4] xs; xs[2] = 7;");
        assert!(matches!(
            &program.items[0],
            Item::Global { ty: Type::Array { elem: Prim::Int, len: 4 }, .. }
        ));
        let Item::Stmt(Stmt::Expr(Expr::Assign { target, .. })) = &program.items[1] else {
            panic!("expected assignment");
        };
        assert!(matches!(target.as_ref(), Expr::Index { .. }));
    }

    #[test]
    fn for_loop_clauses() {
        let program = parse_ok("for (int i = 0; i < 10; ++i) { x = i; }");
        let Item::Stmt(Stmt::For { init, cond, step, .. }) = &program.items[0] else {
            panic!("expected a for loop");
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(matches!(
            step,
            Some(Expr::Unary { op: UnaryOp::PreInc, .. })
        ));
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let (_, errors) = parse(lex("1 = 2;").unwrap());
        assert!(errors.iter().any(|e| e.message.contains("assignment target")));
    }

    #[test]
    fn recovery_collects_multiple_errors() {
        let (program, errors) = parse(lex("int = 5; int y = 6; z = ;").unwrap());
        assert!(errors.len() >= 2, "{errors:?}");
        // The good declaration in the middle still parsed.
        assert!(program.items.iter().any(|i| matches!(i, Item::Global { name, .. } if name == "y")));
    }
}
