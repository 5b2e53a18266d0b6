//! Organization provisioning.
//!
//! `bootstrap_org` creates (or updates) a company and its owner member
//! in one transaction with merge-write semantics: re-running with the
//! same ids updates rather than duplicates. `add_member` is the
//! seat-gated signup path.

use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{Company, Member, MemberRole};
use crate::store::{ChangeBus, ChangeEvent};

/// Operator-supplied inputs for organization bootstrap.
#[derive(Debug, Clone)]
pub struct OrgBootstrap {
    pub company_id: String,
    pub company_name: String,
    pub seat_limit: i64,
    pub owner_uid: String,
    pub owner_email: String,
    pub owner_name: String,
}

/// Provision a company and its owner transactionally. Idempotent.
pub async fn bootstrap_org(pool: &SqlitePool, org: &OrgBootstrap) -> Result<Company> {
    if org.company_id.trim().is_empty() {
        return Err(Error::Validation("company id must not be empty".to_string()));
    }
    if org.seat_limit < 1 {
        return Err(Error::Validation(format!(
            "seat limit must be positive, got {}",
            org.seat_limit
        )));
    }
    if !looks_like_email(&org.owner_email) {
        return Err(Error::Validation(format!(
            "malformed owner email: {}",
            org.owner_email
        )));
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO companies (id, name, seat_limit, seat_count) VALUES (?, ?, ?, 0)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name, seat_limit = excluded.seat_limit
        "#,
    )
    .bind(&org.company_id)
    .bind(&org.company_name)
    .bind(org.seat_limit)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO members (uid, company_id, email, display_name, role) VALUES (?, ?, ?, ?, 'owner')
        ON CONFLICT(uid) DO UPDATE SET
            company_id = excluded.company_id,
            email = excluded.email,
            display_name = excluded.display_name,
            role = 'owner'
        "#,
    )
    .bind(&org.owner_uid)
    .bind(&org.company_id)
    .bind(&org.owner_email)
    .bind(&org.owner_name)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE companies SET seat_count = (SELECT COUNT(*) FROM members WHERE company_id = ?) WHERE id = ?",
    )
    .bind(&org.company_id)
    .bind(&org.company_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    get_company(pool, &org.company_id)
        .await?
        .ok_or_else(|| Error::Persistence("company vanished after bootstrap".to_string()))
}

/// Add (or refresh) a member within a company's seat limit.
pub async fn add_member(
    pool: &SqlitePool,
    bus: &ChangeBus,
    company_id: &str,
    uid: &str,
    email: &str,
    display_name: &str,
) -> Result<Member> {
    if !looks_like_email(email) {
        return Err(Error::Validation(format!("malformed email: {}", email)));
    }

    let mut tx = pool.begin().await?;

    let company = sqlx::query("SELECT seat_limit, seat_count FROM companies WHERE id = ?")
        .bind(company_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::Validation(format!("unknown company: {}", company_id)))?;
    let seat_limit: i64 = company.get("seat_limit");
    let seat_count: i64 = company.get("seat_count");

    let already_member: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM members WHERE uid = ? AND company_id = ?")
            .bind(uid)
            .bind(company_id)
            .fetch_one(&mut *tx)
            .await?;
    if !already_member && seat_count >= seat_limit {
        return Err(Error::Authorization(format!(
            "seat limit reached ({}/{})",
            seat_count, seat_limit
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO members (uid, company_id, email, display_name, role) VALUES (?, ?, ?, ?, 'member')
        ON CONFLICT(uid) DO UPDATE SET
            company_id = excluded.company_id,
            email = excluded.email,
            display_name = excluded.display_name
        "#,
    )
    .bind(uid)
    .bind(company_id)
    .bind(email)
    .bind(display_name)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE companies SET seat_count = (SELECT COUNT(*) FROM members WHERE company_id = ?) WHERE id = ?",
    )
    .bind(company_id)
    .bind(company_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    bus.notify(ChangeEvent::Members {
        company_id: company_id.to_string(),
    });

    Ok(Member {
        uid: uid.to_string(),
        company_id: company_id.to_string(),
        email: email.to_string(),
        display_name: display_name.to_string(),
        role: MemberRole::Member,
    })
}

pub async fn get_company(pool: &SqlitePool, id: &str) -> Result<Option<Company>> {
    let row = sqlx::query("SELECT * FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Company {
        id: r.get("id"),
        name: r.get("name"),
        seat_limit: r.get("seat_limit"),
        seat_count: r.get("seat_count"),
    }))
}

/// List a company's members, owners first.
pub async fn list_members(pool: &SqlitePool, company_id: &str) -> Result<Vec<Member>> {
    let rows = sqlx::query("SELECT * FROM members WHERE company_id = ? ORDER BY role DESC, uid")
        .bind(company_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| {
            let role: String = r.get("role");
            Member {
                uid: r.get("uid"),
                company_id: r.get("company_id"),
                email: r.get("email"),
                display_name: r.get("display_name"),
                role: MemberRole::from_str_lossy(&role),
            }
        })
        .collect())
}

fn looks_like_email(s: &str) -> bool {
    let s = s.trim();
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert!(looks_like_email("a@example.com"));
        assert!(!looks_like_email("not-an-email"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("a@nodomain"));
        assert!(!looks_like_email("a b@example.com"));
    }
}
