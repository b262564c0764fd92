//! Translation of scan filters into a read session row restriction.
//!
//! Only column/literal comparisons and their boolean combinations are
//! translated. The host re-applies every filter to what the session returns,
//! so dropping an untranslatable filter is always safe.

use datafusion::logical_expr::expr::{Between, BinaryExpr, InList, Like};
use datafusion::logical_expr::{Expr, Operator};

use crate::client::sql::{quote_identifier, render_literal};

/// A GoogleSQL predicate equivalent to `expr`, or `None` if it has no
/// translation.
pub fn filter_to_sql(expr: &Expr) -> Option<String> {
    match expr {
        Expr::BinaryExpr(BinaryExpr { left, op, right }) => match op {
            Operator::And | Operator::Or => Some(format!(
                "({}) {} ({})",
                filter_to_sql(left)?,
                if *op == Operator::And { "AND" } else { "OR" },
                filter_to_sql(right)?
            )),
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::LtEq
            | Operator::Gt
            | Operator::GtEq => Some(format!(
                "{} {} {}",
                operand(left)?,
                comparison(op)?,
                operand(right)?
            )),
            _ => None,
        },
        Expr::Not(inner) => Some(format!("NOT ({})", filter_to_sql(inner)?)),
        Expr::IsNull(inner) => Some(format!("{} IS NULL", column(inner)?)),
        Expr::IsNotNull(inner) => Some(format!("{} IS NOT NULL", column(inner)?)),
        Expr::InList(InList {
            expr,
            list,
            negated,
        }) => {
            if list.is_empty() {
                return None;
            }
            let values = list.iter().map(literal).collect::<Option<Vec<_>>>()?;
            Some(format!(
                "{} {}IN ({})",
                column(expr)?,
                if *negated { "NOT " } else { "" },
                values.join(", ")
            ))
        }
        Expr::Between(Between {
            expr,
            negated,
            low,
            high,
        }) => Some(format!(
            "{} {}BETWEEN {} AND {}",
            column(expr)?,
            if *negated { "NOT " } else { "" },
            literal(low)?,
            literal(high)?
        )),
        Expr::Like(Like {
            negated,
            expr,
            pattern,
            escape_char: None,
            case_insensitive: false,
        }) => Some(format!(
            "{} {}LIKE {}",
            column(expr)?,
            if *negated { "NOT " } else { "" },
            literal(pattern)?
        )),
        _ => None,
    }
}

/// Conjunction of every translatable filter.
pub fn row_restriction(filters: &[Expr]) -> Option<String> {
    let parts: Vec<String> = filters
        .iter()
        .filter_map(filter_to_sql)
        .map(|p| format!("({p})"))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

fn comparison(op: &Operator) -> Option<&'static str> {
    Some(match op {
        Operator::Eq => "=",
        Operator::NotEq => "<>",
        Operator::Lt => "<",
        Operator::LtEq => "<=",
        Operator::Gt => ">",
        Operator::GtEq => ">=",
        _ => return None,
    })
}

fn operand(expr: &Expr) -> Option<String> {
    column(expr).or_else(|| literal(expr))
}

fn column(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column(col) => Some(quote_identifier(&col.name)),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(value, _) => render_literal(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::logical_expr::{col, lit};

    #[test]
    fn test_comparisons() {
        assert_eq!(
            filter_to_sql(&col("a").eq(lit(5i64))).as_deref(),
            Some("`a` = 5")
        );
        assert_eq!(
            filter_to_sql(&lit("x").not_eq(col("name"))).as_deref(),
            Some("'x' <> `name`")
        );
        assert_eq!(
            filter_to_sql(&col("a").gt_eq(lit(1.5f64))).as_deref(),
            Some("`a` >= 1.5")
        );
    }

    #[test]
    fn test_boolean_combinations() {
        let expr = col("a").lt(lit(3i64)).and(col("b").is_null().or(col("c").is_not_null()));
        assert_eq!(
            filter_to_sql(&expr).as_deref(),
            Some("(`a` < 3) AND ((`b` IS NULL) OR (`c` IS NOT NULL))")
        );
        assert_eq!(
            filter_to_sql(&Expr::Not(Box::new(col("a").eq(lit(true))))).as_deref(),
            Some("NOT (`a` = TRUE)")
        );
    }

    #[test]
    fn test_in_list_between_and_like() {
        assert_eq!(
            filter_to_sql(&col("a").in_list(vec![lit(1i64), lit(2i64)], true)).as_deref(),
            Some("`a` NOT IN (1, 2)")
        );
        assert_eq!(
            filter_to_sql(&col("a").between(lit(1i64), lit(9i64))).as_deref(),
            Some("`a` BETWEEN 1 AND 9")
        );
        assert_eq!(
            filter_to_sql(&col("s").like(lit("ab%"))).as_deref(),
            Some("`s` LIKE 'ab%'")
        );
    }

    #[test]
    fn test_untranslatable_filters_are_dropped() {
        let arithmetic = (col("a") + lit(1i64)).eq(lit(3i64));
        assert!(filter_to_sql(&arithmetic).is_none());
        assert!(filter_to_sql(&col("s").ilike(lit("a%"))).is_none());

        // One untranslatable side makes the whole OR untranslatable
        let mixed = col("a").eq(lit(1i64)).or(arithmetic.clone());
        assert!(filter_to_sql(&mixed).is_none());

        let restriction = row_restriction(&[col("a").eq(lit(1i64)), arithmetic]);
        assert_eq!(restriction.as_deref(), Some("(`a` = 1)"));
        assert!(row_restriction(&[]).is_none());
    }
}
