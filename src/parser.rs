//! Recursive-descent parser producing the AST consumed by the code
//! generator, following the precedence ladder from lowest to highest:
//! assignment, `||`, `&&`, `|`, `^`, `&`, equality, relational, shift,
//! additive, multiplicative, unary, postfix, primary.

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{Keyword, Punct, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();
        while !self.at_eof() {
            if self.check_keyword(Keyword::Struct) && self.peek_ahead_is_struct_decl() {
                program.structs.push(self.parse_struct_decl()?);
                continue;
            }
            if !self.is_type_start() {
                return Err(ParseError::StatementAtFileScope { line: self.line() });
            }
            let base_line = self.line();
            let ty = self.parse_type()?;
            let name = self.expect_identifier()?;
            if self.check_punct(Punct::LParen) {
                let func = self.parse_function_rest(name, ty, base_line)?;
                if let Some(func) = func {
                    program.functions.push(func);
                }
            } else {
                let ty = self.parse_array_suffix(ty)?;
                let init = if self.check_punct(Punct::Assign) {
                    self.advance();
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                self.expect_punct(Punct::Semicolon)?;
                program.globals.push(GlobalVar {
                    name,
                    type_info: ty,
                    init,
                    line: base_line,
                });
            }
        }
        Ok(program)
    }

    fn peek_ahead_is_struct_decl(&self) -> bool {
        // `struct Name {` is a declaration; `struct Name varname` or
        // `struct Name *p` is a variable of struct type.
        let mut i = self.pos + 1;
        if !matches!(self.kind_at(i), Some(TokenKind::Identifier(_))) {
            return false;
        }
        i += 1;
        matches!(self.kind_at(i), Some(TokenKind::Punct(Punct::LBrace)))
    }

    fn parse_struct_decl(&mut self) -> Result<StructDef, ParseError> {
        self.expect_keyword(Keyword::Struct)?;
        let name = self.expect_identifier()?;
        self.expect_punct(Punct::LBrace)?;
        let mut fields = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            let ty = self.parse_type()?;
            let fname = self.expect_identifier()?;
            let ty = self.parse_array_suffix(ty)?;
            self.expect_punct(Punct::Semicolon)?;
            fields.push((fname, ty));
        }
        self.expect_punct(Punct::RBrace)?;
        self.expect_punct(Punct::Semicolon)?;
        Ok(StructDef {
            name,
            fields,
            size: 0, // resolved by the symbol table once every struct is known
        })
    }

    fn parse_function_rest(
        &mut self,
        name: String,
        return_type: TypeInfo,
        line: usize,
    ) -> Result<Option<Function>, ParseError> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                self.consume_qualifiers();
                let ty = self.parse_type()?;
                let pname = self.expect_identifier()?;
                params.push(Param {
                    name: pname,
                    type_info: ty,
                });
                if self.check_punct(Punct::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;

        if self.check_punct(Punct::Semicolon) {
            self.advance();
            return Ok(None); // prototype only; not emitted
        }

        let body = self.parse_block_stmts()?;
        Ok(Some(Function {
            name,
            params,
            return_type,
            body,
            line,
        }))
    }

    fn is_type_start(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(TokenKind::Keyword(Keyword::Int))
                | Some(TokenKind::Keyword(Keyword::Char))
                | Some(TokenKind::Keyword(Keyword::Unsigned))
                | Some(TokenKind::Keyword(Keyword::Void))
                | Some(TokenKind::Keyword(Keyword::Struct))
                | Some(TokenKind::Keyword(Keyword::Volatile))
                | Some(TokenKind::Keyword(Keyword::Const))
                | Some(TokenKind::Keyword(Keyword::Static))
                | Some(TokenKind::Keyword(Keyword::Extern))
        )
    }

    fn consume_qualifiers(&mut self) {
        loop {
            match self.peek_kind() {
                Some(TokenKind::Keyword(Keyword::Volatile))
                | Some(TokenKind::Keyword(Keyword::Const))
                | Some(TokenKind::Keyword(Keyword::Static))
                | Some(TokenKind::Keyword(Keyword::Extern)) => {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn parse_type(&mut self) -> Result<TypeInfo, ParseError> {
        self.consume_qualifiers();
        let mut ty = match self.peek_kind().cloned() {
            Some(TokenKind::Keyword(Keyword::Int)) => {
                self.advance();
                TypeInfo::int()
            }
            Some(TokenKind::Keyword(Keyword::Char)) => {
                self.advance();
                TypeInfo::char_type()
            }
            Some(TokenKind::Keyword(Keyword::Unsigned)) => {
                self.advance();
                if matches!(self.peek_kind(), Some(TokenKind::Keyword(Keyword::Int))) {
                    self.advance();
                }
                TypeInfo::unsigned_int()
            }
            Some(TokenKind::Keyword(Keyword::Void)) => {
                self.advance();
                TypeInfo::void()
            }
            Some(TokenKind::Keyword(Keyword::Struct)) => {
                self.advance();
                let name = self.expect_identifier()?;
                TypeInfo::struct_type(&name)
            }
            _ => {
                return Err(ParseError::UnexpectedToken {
                    line: self.line(),
                    expected: "a type".to_string(),
                    found: self.current_lexeme(),
                })
            }
        };
        self.consume_qualifiers();
        while self.check_punct(Punct::Star) {
            self.advance();
            ty = ty.pointer_to();
        }
        Ok(ty)
    }

    fn parse_array_suffix(&mut self, mut ty: TypeInfo) -> Result<TypeInfo, ParseError> {
        while self.check_punct(Punct::LBracket) {
            self.advance();
            let size = self.expect_int_literal()? as usize;
            self.expect_punct(Punct::RBracket)?;
            ty = ty.array_of(size);
        }
        Ok(ty)
    }

    fn parse_block_stmts(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_punct(Punct::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            stmts.push(self.parse_statement()?);
        }
        self.expect_punct(Punct::RBrace)?;
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        if self.check_punct(Punct::LBrace) {
            return Ok(Stmt::Block(self.parse_block_stmts()?));
        }
        if self.is_type_start() && !self.check_keyword(Keyword::Void) {
            return self.parse_var_decl();
        }
        if self.check_keyword(Keyword::If) {
            return self.parse_if();
        }
        if self.check_keyword(Keyword::While) {
            return self.parse_while();
        }
        if self.check_keyword(Keyword::For) {
            return self.parse_for();
        }
        if self.check_keyword(Keyword::Switch) {
            return self.parse_switch();
        }
        if self.check_keyword(Keyword::Return) {
            let line = self.line();
            self.advance();
            let value = if self.check_punct(Punct::Semicolon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Stmt::Return { value, line });
        }
        if self.check_keyword(Keyword::Break) {
            let line = self.line();
            self.advance();
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Stmt::Break(line));
        }
        if self.check_keyword(Keyword::Continue) {
            let line = self.line();
            self.advance();
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Stmt::Continue(line));
        }
        if self.check_keyword(Keyword::Asm) {
            let line = self.line();
            self.advance();
            self.expect_punct(Punct::LParen)?;
            let body = self.expect_string_literal()?;
            self.expect_punct(Punct::RParen)?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Stmt::Asm { body, line });
        }
        let expr = self.parse_expression()?;
        self.expect_punct(Punct::Semicolon)?;
        Ok(Stmt::ExprStmt(expr))
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let ty = self.parse_type()?;
        let name = self.expect_identifier()?;
        let ty = self.parse_array_suffix(ty)?;
        let init = if self.check_punct(Punct::Assign) {
            self.advance();
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect_punct(Punct::Semicolon)?;
        Ok(Stmt::VarDecl {
            name,
            type_info: ty,
            init,
            line,
        })
    }

    fn parse_initializer(&mut self) -> Result<Expr, ParseError> {
        if self.check_punct(Punct::LBrace) {
            let line = self.line();
            self.advance();
            let mut items = Vec::new();
            if !self.check_punct(Punct::RBrace) {
                loop {
                    items.push(self.parse_assignment()?);
                    if self.check_punct(Punct::Comma) {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect_punct(Punct::RBrace)?;
            Ok(Expr::InitializerList { items, line })
        } else {
            self.parse_expression()
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.check_keyword(Keyword::Else) {
            self.advance();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        self.expect_punct(Punct::LParen)?;
        let init = if self.check_punct(Punct::Semicolon) {
            self.advance();
            None
        } else if self.is_type_start() {
            Some(Box::new(self.parse_var_decl()?))
        } else {
            let e = self.parse_expression()?;
            self.expect_punct(Punct::Semicolon)?;
            Some(Box::new(Stmt::ExprStmt(e)))
        };
        let cond = if self.check_punct(Punct::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::Semicolon)?;
        let step = if self.check_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::RParen)?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
            line,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::LBrace)?;
        let mut cases = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            if self.check_keyword(Keyword::Case) {
                self.advance();
                let value = self.expect_int_literal()?;
                self.expect_colon()?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase { value: Some(value), body });
            } else if self.check_keyword(Keyword::Default) {
                self.advance();
                self.expect_colon()?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase { value: None, body });
            } else {
                return Err(ParseError::UnexpectedToken {
                    line: self.line(),
                    expected: "case or default".to_string(),
                    found: self.current_lexeme(),
                });
            }
        }
        self.expect_punct(Punct::RBrace)?;
        Ok(Stmt::Switch { cond, cases, line })
    }

    fn parse_case_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        while !self.check_keyword(Keyword::Case)
            && !self.check_keyword(Keyword::Default)
            && !self.check_punct(Punct::RBrace)
        {
            stmts.push(self.parse_statement()?);
        }
        Ok(stmts)
    }

    // ---- expressions ----

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_logical_or()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Punct(Punct::Assign)) => Some(AssignOp::Assign),
            Some(TokenKind::Punct(Punct::PlusAssign)) => Some(AssignOp::AddAssign),
            Some(TokenKind::Punct(Punct::MinusAssign)) => Some(AssignOp::SubAssign),
            Some(TokenKind::Punct(Punct::StarAssign)) => Some(AssignOp::MulAssign),
            Some(TokenKind::Punct(Punct::SlashAssign)) => Some(AssignOp::DivAssign),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.line();
            self.advance();
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
                line,
            });
        }
        Ok(lhs)
    }

    fn parse_logical_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_logical_and()?;
        while self.check_punct(Punct::OrOr) {
            let line = self.line();
            self.advance();
            let rhs = self.parse_logical_and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bitor()?;
        while self.check_punct(Punct::AndAnd) {
            let line = self.line();
            self.advance();
            let rhs = self.parse_bitor()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_bitxor, &[(Punct::Pipe, BinOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_bitand, &[(Punct::Caret, BinOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_equality, &[(Punct::Amp, BinOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_relational,
            &[(Punct::EqEq, BinOp::Eq), (Punct::Ne, BinOp::Ne)],
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_shift,
            &[
                (Punct::Lt, BinOp::Lt),
                (Punct::Gt, BinOp::Gt),
                (Punct::Le, BinOp::Le),
                (Punct::Ge, BinOp::Ge),
            ],
        )
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_additive,
            &[(Punct::Shl, BinOp::Shl), (Punct::Shr, BinOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_multiplicative,
            &[(Punct::Plus, BinOp::Add), (Punct::Minus, BinOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_unary,
            &[
                (Punct::Star, BinOp::Mul),
                (Punct::Slash, BinOp::Div),
                (Punct::Percent, BinOp::Mod),
            ],
        )
    }

    fn parse_binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, ParseError>,
        ops: &[(Punct, BinOp)],
    ) -> Result<Expr, ParseError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (punct, op) in ops {
                if self.check_punct(*punct) {
                    let line = self.line();
                    self.advance();
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        line,
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        if self.check_punct(Punct::Amp) {
            self.advance();
            return Ok(Expr::Unary {
                op: UnaryOp::AddrOf,
                expr: Box::new(self.parse_unary()?),
                line,
            });
        }
        if self.check_punct(Punct::Star) {
            self.advance();
            return Ok(Expr::Unary {
                op: UnaryOp::Deref,
                expr: Box::new(self.parse_unary()?),
                line,
            });
        }
        if self.check_punct(Punct::Tilde) {
            self.advance();
            return Ok(Expr::Unary {
                op: UnaryOp::BitNot,
                expr: Box::new(self.parse_unary()?),
                line,
            });
        }
        if self.check_punct(Punct::Not) {
            self.advance();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.parse_unary()?),
                line,
            });
        }
        if self.check_punct(Punct::Minus) {
            self.advance();
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.parse_unary()?),
                line,
            });
        }
        if self.check_punct(Punct::LParen) && self.looks_like_cast() {
            self.advance();
            let ty = self.parse_type()?;
            self.expect_punct(Punct::RParen)?;
            let expr = self.parse_unary()?;
            return Ok(Expr::Cast {
                type_info: ty,
                expr: Box::new(expr),
                line,
            });
        }
        self.parse_postfix()
    }

    fn looks_like_cast(&self) -> bool {
        match self.kind_at(self.pos + 1) {
            Some(TokenKind::Keyword(Keyword::Int))
            | Some(TokenKind::Keyword(Keyword::Char))
            | Some(TokenKind::Keyword(Keyword::Unsigned))
            | Some(TokenKind::Keyword(Keyword::Void))
            | Some(TokenKind::Keyword(Keyword::Struct)) => true,
            _ => false,
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            if self.check_punct(Punct::LParen) {
                if let Expr::VarRef { name, .. } = &expr {
                    let name = name.clone();
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check_punct(Punct::RParen) {
                        loop {
                            args.push(self.parse_assignment()?);
                            if self.check_punct(Punct::Comma) {
                                self.advance();
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect_punct(Punct::RParen)?;
                    expr = Expr::Call { name, args, line };
                    continue;
                }
                break;
            }
            if self.check_punct(Punct::LBracket) {
                self.advance();
                let index = self.parse_expression()?;
                self.expect_punct(Punct::RBracket)?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                    line,
                };
                continue;
            }
            if self.check_punct(Punct::Dot) {
                self.advance();
                let field = self.expect_identifier()?;
                expr = Expr::Member {
                    base: Box::new(expr),
                    field,
                    arrow: false,
                    line,
                };
                continue;
            }
            if self.check_punct(Punct::Arrow) {
                self.advance();
                let field = self.expect_identifier()?;
                expr = Expr::Member {
                    base: Box::new(expr),
                    field,
                    arrow: true,
                    line,
                };
                continue;
            }
            if self.check_punct(Punct::PlusPlus) {
                self.advance();
                expr = Expr::PostIncDec {
                    op: IncDecOp::Inc,
                    expr: Box::new(expr),
                    line,
                };
                continue;
            }
            if self.check_punct(Punct::MinusMinus) {
                self.advance();
                expr = Expr::PostIncDec {
                    op: IncDecOp::Dec,
                    expr: Box::new(expr),
                    line,
                };
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.peek_kind().cloned() {
            Some(TokenKind::IntLiteral(v)) => {
                self.advance();
                Ok(Expr::IntLiteral {
                    value: v,
                    unsigned: false,
                    line,
                })
            }
            Some(TokenKind::UnsignedLiteral(v)) => {
                self.advance();
                Ok(Expr::IntLiteral {
                    value: v as i64,
                    unsigned: true,
                    line,
                })
            }
            Some(TokenKind::CharLiteral(v)) => {
                self.advance();
                Ok(Expr::CharLiteral { value: v, line })
            }
            Some(TokenKind::StringLiteral(v)) => {
                self.advance();
                Ok(Expr::StringLiteral { value: v, line })
            }
            Some(TokenKind::Identifier(name)) => {
                self.advance();
                Ok(Expr::VarRef { name, line })
            }
            Some(TokenKind::Punct(Punct::LParen)) => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::Punct(Punct::LBrace)) => self.parse_initializer(),
            other => Err(ParseError::UnexpectedToken {
                line,
                expected: "an expression".to_string(),
                found: other.map(|_| self.current_lexeme()).unwrap_or_default(),
            }),
        }
    }

    // ---- token stream helpers ----

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn kind_at(&self, idx: usize) -> Option<&TokenKind> {
        self.tokens.get(idx).map(|t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or(0)
    }

    fn current_lexeme(&self) -> String {
        self.tokens
            .get(self.pos)
            .map(|t| t.lexeme.clone())
            .unwrap_or_else(|| "<eof>".to_string())
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check_punct(&self, p: Punct) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Punct(x)) if *x == p)
    }

    fn check_keyword(&self, k: Keyword) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Keyword(x)) if *x == k)
    }

    fn expect_punct(&mut self, p: Punct) -> Result<(), ParseError> {
        if self.check_punct(p) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: format!("{p:?}"),
                found: self.current_lexeme(),
            })
        }
    }

    fn expect_colon(&mut self) -> Result<(), ParseError> {
        if matches!(self.peek_kind(), Some(TokenKind::Punct(Punct::Colon))) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: ":".to_string(),
                found: self.current_lexeme(),
            })
        }
    }

    fn expect_keyword(&mut self, k: Keyword) -> Result<(), ParseError> {
        if self.check_keyword(k) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: format!("{k:?}"),
                found: self.current_lexeme(),
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek_kind().cloned() {
            Some(TokenKind::Identifier(name)) => {
                self.advance();
                Ok(name)
            }
            _ => Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: "an identifier".to_string(),
                found: self.current_lexeme(),
            }),
        }
    }

    fn expect_int_literal(&mut self) -> Result<i64, ParseError> {
        match self.peek_kind().cloned() {
            Some(TokenKind::IntLiteral(v)) => {
                self.advance();
                Ok(v)
            }
            Some(TokenKind::UnsignedLiteral(v)) => {
                self.advance();
                Ok(v as i64)
            }
            _ => Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: "an integer literal".to_string(),
                found: self.current_lexeme(),
            }),
        }
    }

    fn expect_string_literal(&mut self) -> Result<String, ParseError> {
        match self.peek_kind().cloned() {
            Some(TokenKind::StringLiteral(v)) => {
                self.advance();
                Ok(v)
            }
            _ => Err(ParseError::UnexpectedToken {
                line: self.line(),
                expected: "a string literal".to_string(),
                found: self.current_lexeme(),
            }),
        }
    }
}

/// Parses a full translation unit's worth of tokens.
pub fn parse(tokens: Vec<Token>) -> Result<Program, ParseError> {
    Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(src: &str) -> Program {
        parse(tokenize(src).unwrap()).unwrap()
    }

    #[test]
    fn precedence_nests_multiplicative_under_additive() {
        let program = parse_src("int main(){return 1+2*3;}");
        let Stmt::Return { value: Some(Expr::Binary { op, lhs, rhs, .. }), .. } =
            &program.functions[0].body[0]
        else {
            panic!("expected a return of a binary expression");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(**lhs, Expr::IntLiteral { value: 1, .. }));
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn logical_and_binds_tighter_than_logical_or() {
        let program = parse_src("int main(){return 1||2&&3;}");
        let Stmt::Return { value: Some(Expr::Logical { op: LogicalOp::Or, rhs, .. }), .. } =
            &program.functions[0].body[0]
        else {
            panic!("expected the outermost operator to be ||");
        };
        assert!(matches!(**rhs, Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn cast_is_distinguished_from_parenthesized_expression() {
        let program = parse_src("int main(){int x; x=(int)5; return x;}");
        let Stmt::ExprStmt(Expr::Assign { value, .. }) = &program.functions[0].body[1] else {
            panic!("expected an assignment statement");
        };
        assert!(matches!(**value, Expr::Cast { .. }));

        let program = parse_src("int main(){int x; x=(5); return x;}");
        let Stmt::ExprStmt(Expr::Assign { value, .. }) = &program.functions[0].body[1] else {
            panic!("expected an assignment statement");
        };
        assert!(matches!(**value, Expr::IntLiteral { value: 5, .. }));
    }

    #[test]
    fn struct_declaration_is_distinguished_from_struct_variable() {
        let program = parse_src(
            "struct Point { int x; int y; }; \
             int main(){struct Point p; return 0;}",
        );
        assert_eq!(program.structs.len(), 1);
        assert_eq!(program.structs[0].name, "Point");
        let Stmt::VarDecl { type_info, .. } = &program.functions[0].body[0] else {
            panic!("expected a struct variable declaration");
        };
        assert!(type_info.is_struct);
        assert_eq!(type_info.struct_name.as_deref(), Some("Point"));
    }

    #[test]
    fn statement_at_file_scope_is_an_error() {
        let err = parse(tokenize("return 0;").unwrap()).unwrap_err();
        assert!(matches!(err, ParseError::StatementAtFileScope { .. }));
    }

    #[test]
    fn switch_parses_cases_and_default() {
        let program = parse_src(
            "int main(){int x; switch(x){case 1: return 1; case 2: return 2; default: return 0;}}",
        );
        let Stmt::Switch { cases, .. } = &program.functions[0].body[1] else {
            panic!("expected a switch statement");
        };
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].value, Some(1));
        assert_eq!(cases[1].value, Some(2));
        assert_eq!(cases[2].value, None);
    }

    #[test]
    fn initializer_list_parses_array_elements() {
        let program = parse_src("int main(){int a[3]={1,2,3}; return 0;}");
        let Stmt::VarDecl { init: Some(Expr::InitializerList { items, .. }), .. } = &program.functions[0].body[0]
        else {
            panic!("expected an initializer-list declaration");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn pointer_levels_and_array_suffix_parse_on_params_and_globals() {
        let program = parse_src("int *g; int f(char **pp){return 0;} int main(){return 0;}");
        assert_eq!(program.globals[0].type_info.pointer_level, 1);
        assert_eq!(program.functions[0].params[0].type_info.pointer_level, 2);
    }
}
