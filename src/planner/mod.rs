//! SQL planner for Basalt
//!
//! A recursive-descent parser that turns one SQL statement into a logical
//! plan tree directly: FROM becomes TableScan / NestedLoopJoin, WHERE a
//! Filter, ORDER BY / LIMIT a Sort, and the select list a Project on top.
//! Column names are qualified (`alias.column`) as soon as a query involves
//! more than one table or an explicit alias, so join predicates like
//! `a.x = b.y` resolve against the combined row.

use crate::error::{BasaltError, Result};
use crate::lexer::{Lexer, Token};
use crate::types::{ColumnDef, DataType, Value};

pub mod plan;

pub use plan::{
    ArithOp, Assignment, CompareOp, Operand, OutputColumn, PlanNode, Predicate, Projection,
    ScalarExpr, SortKey,
};

/// The SQL planner. One instance per statement.
pub struct Planner {
    tokens: Vec<Token>,
    pos: usize,
}

impl Planner {
    /// Parse one SQL statement into a plan tree.
    pub fn plan(sql: &str) -> Result<PlanNode> {
        let tokens = Lexer::new(sql).tokenize()?;
        let mut planner = Self { tokens, pos: 0 };
        let node = planner.parse_statement()?;
        planner.consume_if(&Token::Semicolon);
        planner.expect(&Token::Eof)?;
        Ok(node)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        token
    }

    fn consume_if(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.peek() == token {
            self.pos += 1;
            Ok(())
        } else {
            Err(BasaltError::Syntax(format!(
                "expected {:?}, found {:?}",
                token,
                self.peek()
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Token::Identifier(name) => Ok(name),
            other => Err(BasaltError::Syntax(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    /// `name` or `qualifier.name`
    fn parse_qualified_name(&mut self) -> Result<String> {
        let mut name = self.expect_identifier()?;
        while self.consume_if(&Token::Dot) {
            name.push('.');
            name.push_str(&self.expect_identifier()?);
        }
        Ok(name)
    }

    fn parse_statement(&mut self) -> Result<PlanNode> {
        match self.peek() {
            Token::Select => self.parse_select(),
            Token::Insert => self.parse_insert(),
            Token::Update => self.parse_update(),
            Token::Delete => self.parse_delete(),
            Token::Create => self.parse_create_table(),
            Token::Drop => self.parse_drop_table(),
            other => Err(BasaltError::Syntax(format!(
                "unexpected token {:?} at start of statement",
                other
            ))),
        }
    }

    //=========================================================================
    // SELECT
    //=========================================================================

    fn parse_select(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Select)?;
        let projection = self.parse_projection()?;

        self.expect(&Token::From)?;
        let first = self.parse_table_ref()?;
        let mut cross_refs = Vec::new();
        while self.consume_if(&Token::Comma) {
            cross_refs.push(self.parse_table_ref()?);
        }
        let mut joins = Vec::new();
        while self.consume_if(&Token::Join) {
            let table_ref = self.parse_table_ref()?;
            self.expect(&Token::On)?;
            let condition = self.parse_predicate()?;
            joins.push((table_ref, condition));
        }

        // Qualify column names whenever resolution could be ambiguous.
        let multi = !cross_refs.is_empty() || !joins.is_empty();
        let qualify =
            multi || first.1.is_some() || cross_refs.iter().any(|(_, alias)| alias.is_some());

        let scan = |(table, alias): (String, Option<String>)| -> PlanNode {
            let label = alias.clone().unwrap_or_else(|| table.clone());
            PlanNode::TableScan {
                table,
                alias: if qualify { Some(label) } else { None },
            }
        };

        let mut node = scan(first);
        for table_ref in cross_refs {
            node = PlanNode::NestedLoopJoin {
                left: Box::new(node),
                right: Box::new(scan(table_ref)),
                condition: None,
            };
        }
        for (table_ref, condition) in joins {
            node = PlanNode::NestedLoopJoin {
                left: Box::new(node),
                right: Box::new(scan(table_ref)),
                condition: Some(condition),
            };
        }

        if self.consume_if(&Token::Where) {
            node = PlanNode::Filter {
                condition: self.parse_predicate()?,
                child: Box::new(node),
            };
        }

        let mut keys = Vec::new();
        if self.consume_if(&Token::Order) {
            self.expect(&Token::By)?;
            loop {
                let column = self.parse_qualified_name()?;
                let descending = if self.consume_if(&Token::Desc) {
                    true
                } else {
                    self.consume_if(&Token::Asc);
                    false
                };
                keys.push(SortKey { column, descending });
                if !self.consume_if(&Token::Comma) {
                    break;
                }
            }
        }
        let limit = if self.consume_if(&Token::Limit) {
            match self.advance() {
                Token::NumberLiteral(n) => Some(n.parse::<usize>().map_err(|_| {
                    BasaltError::Syntax(format!("invalid LIMIT value '{}'", n))
                })?),
                other => {
                    return Err(BasaltError::Syntax(format!(
                        "expected number after LIMIT, found {:?}",
                        other
                    )))
                }
            }
        } else {
            None
        };
        if !keys.is_empty() || limit.is_some() {
            node = PlanNode::Sort {
                keys,
                limit,
                child: Box::new(node),
            };
        }

        Ok(PlanNode::Project {
            projection,
            child: Box::new(node),
        })
    }

    fn parse_projection(&mut self) -> Result<Projection> {
        if self.consume_if(&Token::Star) {
            return Ok(Projection::All);
        }
        let mut columns = Vec::new();
        loop {
            let column = self.parse_qualified_name()?;
            let alias = if self.consume_if(&Token::As) {
                Some(self.expect_identifier()?)
            } else if let Token::Identifier(_) = self.peek() {
                Some(self.expect_identifier()?)
            } else {
                None
            };
            columns.push(OutputColumn { column, alias });
            if !self.consume_if(&Token::Comma) {
                break;
            }
        }
        Ok(Projection::Columns(columns))
    }

    /// `table [AS alias | alias]`
    fn parse_table_ref(&mut self) -> Result<(String, Option<String>)> {
        let table = self.expect_identifier()?;
        let alias = if self.consume_if(&Token::As) {
            Some(self.expect_identifier()?)
        } else if let Token::Identifier(_) = self.peek() {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok((table, alias))
    }

    //=========================================================================
    // Predicates
    //=========================================================================

    fn parse_predicate(&mut self) -> Result<Predicate> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_and()?];
        while self.consume_if(&Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().expect("non-empty")
        } else {
            Predicate::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_not()?];
        while self.consume_if(&Token::And) {
            parts.push(self.parse_not()?);
        }
        Ok(if parts.len() == 1 {
            parts.pop().expect("non-empty")
        } else {
            Predicate::And(parts)
        })
    }

    fn parse_not(&mut self) -> Result<Predicate> {
        if self.consume_if(&Token::Not) {
            Ok(Predicate::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate> {
        if self.consume_if(&Token::LeftParen) {
            let inner = self.parse_or()?;
            self.expect(&Token::RightParen)?;
            return Ok(inner);
        }

        let column = self.parse_qualified_name()?;
        match self.peek().clone() {
            Token::Is => {
                self.advance();
                let negated = self.consume_if(&Token::Not);
                self.expect(&Token::Null)?;
                Ok(Predicate::IsNull { column, negated })
            }
            Token::Like => {
                self.advance();
                match self.advance() {
                    Token::StringLiteral(pattern) => Ok(Predicate::Like { column, pattern }),
                    other => Err(BasaltError::Syntax(format!(
                        "expected string pattern after LIKE, found {:?}",
                        other
                    ))),
                }
            }
            Token::In => {
                self.advance();
                self.expect(&Token::LeftParen)?;
                let mut list = vec![self.parse_literal()?];
                while self.consume_if(&Token::Comma) {
                    list.push(self.parse_literal()?);
                }
                self.expect(&Token::RightParen)?;
                Ok(Predicate::In { column, list })
            }
            Token::Between => {
                self.advance();
                let low = self.parse_literal()?;
                self.expect(&Token::And)?;
                let high = self.parse_literal()?;
                Ok(Predicate::Between { column, low, high })
            }
            op_token => {
                let op = match op_token {
                    Token::Equal => CompareOp::Eq,
                    Token::NotEqual => CompareOp::NotEq,
                    Token::GreaterThan => CompareOp::Gt,
                    Token::GreaterThanEq => CompareOp::Ge,
                    Token::LessThan => CompareOp::Lt,
                    Token::LessThanEq => CompareOp::Le,
                    other => {
                        return Err(BasaltError::Syntax(format!(
                            "expected comparison operator after '{}', found {:?}",
                            column, other
                        )))
                    }
                };
                self.advance();
                let value = if matches!(self.peek(), Token::Identifier(_)) {
                    Operand::ColumnRef(self.parse_qualified_name()?)
                } else {
                    Operand::Literal(self.parse_literal()?)
                };
                Ok(Predicate::Compare { column, op, value })
            }
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.advance() {
            Token::NumberLiteral(n) => parse_number(&n),
            Token::Minus => match self.advance() {
                Token::NumberLiteral(n) => match parse_number(&n)? {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Ok(other),
                },
                other => Err(BasaltError::Syntax(format!(
                    "expected number after '-', found {:?}",
                    other
                ))),
            },
            Token::StringLiteral(s) => Ok(Value::Text(s)),
            Token::Null => Ok(Value::Null),
            other => Err(BasaltError::Syntax(format!(
                "expected literal value, found {:?}",
                other
            ))),
        }
    }

    //=========================================================================
    // DML
    //=========================================================================

    fn parse_insert(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;
        let table = self.expect_identifier()?;

        let columns = if self.consume_if(&Token::LeftParen) {
            let mut cols = vec![self.expect_identifier()?];
            while self.consume_if(&Token::Comma) {
                cols.push(self.expect_identifier()?);
            }
            self.expect(&Token::RightParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Token::Values)?;
        self.expect(&Token::LeftParen)?;
        let mut values = vec![self.parse_literal()?];
        while self.consume_if(&Token::Comma) {
            values.push(self.parse_literal()?);
        }
        self.expect(&Token::RightParen)?;
        if self.consume_if(&Token::Comma) {
            return Err(BasaltError::Syntax(
                "INSERT takes one row per statement".into(),
            ));
        }

        Ok(PlanNode::Insert {
            table,
            columns,
            values,
        })
    }

    fn parse_update(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Update)?;
        let table = self.expect_identifier()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(&Token::Equal)?;
            let expr = self.parse_scalar_expr()?;
            assignments.push(Assignment { column, expr });
            if !self.consume_if(&Token::Comma) {
                break;
            }
        }

        let filter = if self.consume_if(&Token::Where) {
            Some(self.parse_predicate()?)
        } else {
            None
        };

        Ok(PlanNode::Update {
            table,
            assignments,
            filter,
        })
    }

    fn parse_delete(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;
        let table = self.expect_identifier()?;
        let filter = if self.consume_if(&Token::Where) {
            Some(self.parse_predicate()?)
        } else {
            None
        };
        Ok(PlanNode::Delete { table, filter })
    }

    //=========================================================================
    // Scalar expressions (UPDATE SET)
    //=========================================================================

    fn parse_scalar_expr(&mut self) -> Result<ScalarExpr> {
        let mut left = self.parse_scalar_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => ArithOp::Add,
                Token::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_scalar_term()?;
            left = ScalarExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_scalar_term(&mut self) -> Result<ScalarExpr> {
        let mut left = self.parse_scalar_factor()?;
        loop {
            let op = match self.peek() {
                Token::Star => ArithOp::Mul,
                Token::Slash => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_scalar_factor()?;
            left = ScalarExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_scalar_factor(&mut self) -> Result<ScalarExpr> {
        match self.peek().clone() {
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_scalar_expr()?;
                self.expect(&Token::RightParen)?;
                Ok(inner)
            }
            Token::Identifier(_) => Ok(ScalarExpr::Column(self.parse_qualified_name()?)),
            _ => Ok(ScalarExpr::Literal(self.parse_literal()?)),
        }
    }

    //=========================================================================
    // DDL
    //=========================================================================

    fn parse_create_table(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Create)?;
        self.expect(&Token::Table)?;
        let table = self.expect_identifier()?;
        self.expect(&Token::LeftParen)?;

        let mut columns = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let data_type = self.parse_data_type()?;
            columns.push(ColumnDef { name, data_type });
            if !self.consume_if(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RightParen)?;

        Ok(PlanNode::CreateTable { table, columns })
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        match self.advance() {
            Token::Int => Ok(DataType::Int),
            Token::Float => Ok(DataType::Float),
            Token::Char => Ok(DataType::Char(self.parse_type_length()?)),
            Token::Varchar => Ok(DataType::Varchar(self.parse_type_length()?)),
            other => Err(BasaltError::Syntax(format!(
                "expected column type, found {:?}",
                other
            ))),
        }
    }

    fn parse_type_length(&mut self) -> Result<u16> {
        self.expect(&Token::LeftParen)?;
        let n = match self.advance() {
            Token::NumberLiteral(n) => n
                .parse::<u16>()
                .map_err(|_| BasaltError::Syntax(format!("invalid type length '{}'", n)))?,
            other => {
                return Err(BasaltError::Syntax(format!(
                    "expected length, found {:?}",
                    other
                )))
            }
        };
        self.expect(&Token::RightParen)?;
        Ok(n)
    }

    fn parse_drop_table(&mut self) -> Result<PlanNode> {
        self.expect(&Token::Drop)?;
        self.expect(&Token::Table)?;
        let if_exists = if self.consume_if(&Token::If) {
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };
        let table = self.expect_identifier()?;
        Ok(PlanNode::DropTable { table, if_exists })
    }
}

fn parse_number(raw: &str) -> Result<Value> {
    if raw.contains('.') {
        raw.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| BasaltError::Syntax(format!("invalid number '{}'", raw)))
    } else {
        raw.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| BasaltError::Syntax(format!("invalid number '{}'", raw)))
    }
}
