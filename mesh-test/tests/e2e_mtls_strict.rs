#![cfg(feature = "live-cluster")]

use mesh_test::{
    check,
    manifest::{Catalog, Vars, PEER_AUTHENTICATION_PERMISSIVE, PEER_AUTHENTICATION_STRICT},
    retry,
    samples::{httpbin, sleep, SidecarInject},
    Group, TestCase,
};

#[tokio::test(flavor = "current_thread")]
async fn strict_mtls_rejects_plaintext_clients() {
    TestCase::new("mTLS STRICT mode rejects plaintext traffic")
        .id("T3")
        .groups(&[Group::Full, Group::Smoke, Group::Arm, Group::Interop])
        .run(|ctx| async move {
            ctx.step("Create the server and client namespaces");
            let server_ns = ctx.temp_namespace("mtls-server", SidecarInject::Enabled).await?;
            let legacy_ns = ctx.temp_namespace("mtls-legacy", SidecarInject::Disabled).await?;
            let cluster = ctx.cluster().await?;

            ctx.step("Deploy httpbin and the sleep clients");
            cluster.create(httpbin::service(&server_ns)).await?;
            tokio::try_join!(
                cluster.create_ready_pod(httpbin::pod(&server_ns, SidecarInject::Enabled)),
                cluster.create_ready_pod(sleep::pod(&server_ns, "sleep", SidecarInject::Enabled)),
                cluster.create_ready_pod(sleep::pod(&legacy_ns, "sleep", SidecarInject::Disabled)),
            )?;

            let url = httpbin::url(&server_ns, "/ip");
            let kubectl = ctx.kubectl().clone();

            ctx.step("Plaintext requests succeed in PERMISSIVE mode");
            let catalog = Catalog::builtin();
            let vars = Vars::namespace(&server_ns);
            kubectl
                .apply(&server_ns, &catalog.render(PEER_AUTHENTICATION_PERMISSIVE, &vars)?)
                .await?;
            retry::until_success("plaintext request succeeds", |_| {
                let (kubectl, legacy_ns, url) = (&kubectl, &legacy_ns, &url);
                async move {
                    let status = sleep::curl_status(kubectl, legacy_ns, "sleep", url).await?;
                    check::output_contains(&status, "200")?;
                    Ok::<_, mesh_test::Error>(())
                }
            })
            .await?;

            ctx.step("Apply STRICT PeerAuthentication");
            let strict = catalog.render(PEER_AUTHENTICATION_STRICT, &vars)?;
            kubectl.apply(&server_ns, &strict).await?;
            {
                let (kubectl, ns) = (kubectl.clone(), server_ns.clone());
                ctx.cleanup("delete STRICT PeerAuthentication", async move {
                    kubectl.delete(&ns, &strict).await
                });
            }

            ctx.step("Plaintext requests are rejected");
            retry::until_success("plaintext request is rejected", |_| {
                let (kubectl, legacy_ns, url) = (&kubectl, &legacy_ns, &url);
                async move {
                    match sleep::curl_status(kubectl, legacy_ns, "sleep", url).await {
                        // curl: (56) Recv failure: Connection reset by peer
                        Err(mesh_test::Error::CommandFailed { .. }) => Ok(()),
                        Err(error) => Err(error),
                        Ok(status) => Err(check::Failure::new(format!(
                            "expected the plaintext request to fail, but got HTTP {status}"
                        ))
                        .into()),
                    }
                }
            })
            .await?;

            ctx.step("Mesh clients still reach httpbin");
            let status = sleep::curl_status(&kubectl, &server_ns, "sleep", &url).await?;
            check::output_contains(&status, "200")?;

            Ok(())
        })
        .await;
}
