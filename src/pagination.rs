use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{AsyncSession, Session};
use crate::statement::{Select, Statement};
use crate::value::Value;

/// Page descriptor returned alongside a page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(total: u64, page: u32, per_page: u32) -> Self {
        Self {
            total,
            page,
            per_page,
            total_pages: total.div_ceil(u64::from(per_page)),
        }
    }

    /// `{"total":…,"page":…,"per_page":…,"total_pages":…}`
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn check(page: u32, per_page: u32) -> Result<()> {
    if page == 0 {
        return Err(Error::InvalidPagination("page starts at 1".to_string()));
    }
    if per_page == 0 {
        return Err(Error::InvalidPagination(
            "per_page must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn total(count: Option<Value>) -> Result<u64> {
    match count {
        None => Ok(0),
        Some(value) => value
            .as_i64()
            .and_then(|count| u64::try_from(count).ok())
            .ok_or_else(|| Error::Conversion(format!("row count {value:?}"))),
    }
}

fn slice(select: Select, pagination: &Pagination) -> Select {
    let page = u64::from(pagination.page);
    let per_page = u64::from(pagination.per_page);
    select.slice((page - 1) * per_page, per_page)
}

/// Count the rows of `select` and restrict it to the requested page.
/// Without both `page` and `per_page` the select is returned unchanged.
pub fn apply_pagination<S: Session>(
    session: &mut S,
    select: Select,
    page: Option<u32>,
    per_page: Option<u32>,
) -> Result<(Select, Option<Pagination>)> {
    let (Some(page), Some(per_page)) = (page, per_page) else {
        return Ok((select, None));
    };
    check(page, per_page)?;

    let count = session.scalar(&Statement::Select(select.count()))?;
    let pagination = Pagination::new(total(count)?, page, per_page);
    Ok((slice(select, &pagination), Some(pagination)))
}

pub async fn async_apply_pagination<S: AsyncSession>(
    session: &S,
    select: Select,
    page: Option<u32>,
    per_page: Option<u32>,
) -> Result<(Select, Option<Pagination>)> {
    let (Some(page), Some(per_page)) = (page, per_page) else {
        return Ok((select, None));
    };
    check(page, per_page)?;

    let count = session.scalar(&Statement::Select(select.count())).await?;
    let pagination = Pagination::new(total(count)?, page, per_page);
    Ok((slice(select, &pagination), Some(pagination)))
}
