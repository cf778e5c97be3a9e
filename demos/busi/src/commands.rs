use std::time::Duration;
use tcc::{Branch, Coordinator, GlobalTransaction};

use crate::busi::ReqHttp;

fn endpoints(busi: &str, account: &str) -> [String; 3] {
    ["try", "confirm", "revert"].map(|op| format!("{busi}/{account}/{op}"))
}

/// Transfers 30 from the TransOut user to the TransIn user.
pub async fn tcc(coordinator: &Coordinator, busi: &str) -> anyhow::Result<String> {
    tracing::debug!("tcc simple transaction begin");

    let gid = tcc::gid();
    let req = ReqHttp {
        amount: 30,
        ..Default::default()
    };

    coordinator
        .tcc(&gid, |tcc| async move {
            let [try_out, confirm_out, revert_out] = endpoints(busi, "trans-out");
            tcc.call_branch(&req, try_out, confirm_out, revert_out)
                .await?;

            let [try_in, confirm_in, revert_in] = endpoints(busi, "trans-in");
            tcc.call_branch(&req, try_in, confirm_in, revert_in).await?;

            Ok(())
        })
        .await?;

    Ok(gid)
}

/// Same transfer with a TransIn Try answering `FAILURE`, rolled back.
pub async fn tcc_rollback(coordinator: &Coordinator, busi: &str) -> anyhow::Result<String> {
    tracing::debug!("tcc rollback transaction begin");

    let gid = tcc::gid();
    let req = ReqHttp {
        amount: 30,
        trans_in_result: Some("FAILURE".to_owned()),
        ..Default::default()
    };

    let res = coordinator
        .tcc(&gid, |tcc| async move {
            let [try_out, confirm_out, revert_out] = endpoints(busi, "trans-out");
            tcc.call_branch(&req, try_out, confirm_out, revert_out)
                .await?;

            let [try_in, confirm_in, revert_in] = endpoints(busi, "trans-in");
            tcc.call_branch(&req, try_in, confirm_in, revert_in).await?;

            Ok(())
        })
        .await;

    if let Err(err) = res {
        tracing::error!("error is: {err}");
    }

    Ok(gid)
}

/// Polls until every branch acknowledged Confirm or Cancel.
pub async fn wait_finished(
    coordinator: &Coordinator,
    gid: &str,
) -> anyhow::Result<(GlobalTransaction, Vec<Branch>)> {
    for _ in 0..300 {
        let (txn, branches) = coordinator.query(gid).await?;
        if txn.is_finished() {
            return Ok((txn, branches));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("transaction {gid} still not finished")
}
