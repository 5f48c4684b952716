use super::Diagnostic;
use super::ast::*;
use super::lexer::{Token, TokenKind};

/// Deepest nesting of blocks and expressions accepted by the parser
const MAX_NESTING: usize = 128;

/// Number of binary precedence levels, see [`binary_op`]
const BINARY_LEVELS: usize = 6;

type ParseResult<T> = Result<T, Diagnostic>;

fn binary_op(level: usize, kind: &TokenKind) -> Option<BinaryOp> {
    let op = match (level, kind) {
        (0, TokenKind::OrOr) => BinaryOp::Or,
        (1, TokenKind::AndAnd) => BinaryOp::And,
        (2, TokenKind::EqEq) => BinaryOp::Eq,
        (2, TokenKind::NotEq) => BinaryOp::Ne,
        (3, TokenKind::Lt) => BinaryOp::Lt,
        (3, TokenKind::Le) => BinaryOp::Le,
        (3, TokenKind::Gt) => BinaryOp::Gt,
        (3, TokenKind::Ge) => BinaryOp::Ge,
        (4, TokenKind::Plus) => BinaryOp::Add,
        (4, TokenKind::Minus) => BinaryOp::Sub,
        (5, TokenKind::Star) => BinaryOp::Mul,
        (5, TokenKind::Slash) => BinaryOp::Div,
        (5, TokenKind::Percent) => BinaryOp::Rem,
        _ => return None,
    };
    Some(op)
}

struct Parser<'a> {
    unit: &'a str,
    tokens: Vec<Token>,
    cursor: usize,
    depth: usize,
}

/// Parses the items of one unit
///
/// A syntax error abandons the current item; parsing resumes at the next
/// `fn` so that every broken item gets its own diagnostic.
pub fn parse(unit: &str, tokens: Vec<Token>, diagnostics: &mut Vec<Diagnostic>) -> Vec<FnDecl> {
    let mut parser = Parser {
        unit,
        tokens,
        cursor: 0,
        depth: 0,
    };
    let mut items = Vec::new();

    while parser.peek().kind != TokenKind::Eof {
        let result = if parser.peek().kind == TokenKind::Fn {
            parser.function()
        } else {
            Err(parser.unexpected("'fn'"))
        };
        match result {
            Ok(item) => items.push(item),
            Err(diagnostic) => {
                diagnostics.push(diagnostic);
                parser.depth = 0;
                parser.synchronize();
            }
        }
    }

    items
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with Eof
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn pos(&self) -> Pos {
        let token = self.peek();
        Pos {
            line: token.line,
            column: token.column,
        }
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.cursor += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> ParseResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn ident(&mut self) -> ParseResult<(String, Pos)> {
        let pos = self.pos();
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok((name, pos))
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let token = self.peek();
        Diagnostic::error(
            self.unit,
            token.line,
            token.column,
            format!("expected {expected}, found {}", token.kind.describe()),
        )
    }

    fn synchronize(&mut self) {
        while !matches!(self.peek().kind, TokenKind::Fn | TokenKind::Eof) {
            self.advance();
        }
    }

    fn enter(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let pos = self.pos();
            return Err(Diagnostic::error(
                self.unit,
                pos.line,
                pos.column,
                format!("nesting is too deep (limit {MAX_NESTING})"),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn function(&mut self) -> ParseResult<FnDecl> {
        let pos = self.pos();
        self.expect(TokenKind::Fn, "'fn'")?;
        let (name, _) = self.ident()?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.block()?;
        Ok(FnDecl {
            name,
            params,
            body,
            pos,
        })
    }

    fn block(&mut self) -> ParseResult<Block> {
        self.expect(TokenKind::LBrace, "'{'")?;
        self.enter()?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.unexpected("'}'"));
            }
            stmts.push(self.statement()?);
        }
        self.advance();
        self.leave();
        Ok(Block { stmts })
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        let kind = match self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let (name, _) = self.ident()?;
                self.expect(TokenKind::Assign, "'='")?;
                let init = self.expression()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                StmtKind::Let { name, init }
            }
            TokenKind::If => return self.if_statement(),
            TokenKind::While => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            TokenKind::For => {
                self.advance();
                let (var, _) = self.ident()?;
                self.expect(TokenKind::In, "'in'")?;
                let start = self.expression()?;
                self.expect(TokenKind::DotDot, "'..'")?;
                let end = self.expression()?;
                let body = self.block()?;
                StmtKind::For {
                    var,
                    start,
                    end,
                    body,
                }
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                StmtKind::Return(value)
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                StmtKind::Continue
            }
            TokenKind::LBrace => StmtKind::Block(self.block()?),
            _ => {
                let expr = self.expression()?;
                let kind = if self.eat(&TokenKind::Assign) {
                    if !matches!(expr.kind, ExprKind::Var(_) | ExprKind::Index { .. }) {
                        return Err(Diagnostic::error(
                            self.unit,
                            expr.pos.line,
                            expr.pos.column,
                            "invalid assignment target",
                        ));
                    }
                    let value = self.expression()?;
                    StmtKind::Assign {
                        target: expr,
                        value,
                    }
                } else {
                    StmtKind::Expr(expr)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                kind
            }
        };
        Ok(Stmt { kind, pos })
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        self.expect(TokenKind::If, "'if'")?;
        let cond = self.expression()?;
        let then = self.block()?;
        let otherwise = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                self.enter()?;
                let nested = self.if_statement()?;
                self.leave();
                Some(Block {
                    stmts: vec![nested],
                })
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then,
                otherwise,
            },
            pos,
        })
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.enter()?;
        let expr = self.binary(0);
        self.leave();
        expr
    }

    /// Precedence climbing, `level` 0 binds loosest
    fn binary(&mut self, level: usize) -> ParseResult<Expr> {
        if level == BINARY_LEVELS {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = binary_op(level, &self.peek().kind) {
            let pos = self.pos();
            self.advance();
            let rhs = self.binary(level + 1)?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary()?;
        self.leave();
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            pos,
        })
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        while self.check(&TokenKind::LBracket) {
            let pos = self.pos();
            self.advance();
            let index = self.expression()?;
            self.expect(TokenKind::RBracket, "']'")?;
            expr = Expr {
                kind: ExprKind::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                },
                pos,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        let kind = match self.peek().kind.clone() {
            TokenKind::Int(v) => {
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Nil => {
                self.advance();
                ExprKind::Nil
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.arguments(TokenKind::RParen, "')'")?;
                    ExprKind::Call { name, args }
                } else {
                    ExprKind::Var(name)
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                ExprKind::Array(self.arguments(TokenKind::RBracket, "']'")?)
            }
            _ => return Err(self.unexpected("expression")),
        };
        Ok(Expr { kind, pos })
    }

    /// Comma separated expressions up to and including `close`
    fn arguments(&mut self, close: TokenKind, what: &str) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(close, what)?;
        Ok(args)
    }
}
